//! HTTP fetches against one scrape target.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};

use super::{parse_exposition, FetchError, MetricFamily};
use crate::config::BasicAuth;

/// Lines longer than this are delivered in pieces.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Performs the metrics, process, and log fetches for scrape targets.
///
/// Cloning is cheap and shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct TargetFetcher {
    client: Client,
    timeout: Duration,
}

impl TargetFetcher {
    /// Create a fetcher whose one-shot requests time out after `timeout`.
    /// Log tails have no timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// Fetch and parse a text exposition payload.
    pub async fn fetch_metrics(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> Result<BTreeMap<String, MetricFamily>, FetchError> {
        let request = with_auth(self.client.get(url).timeout(self.timeout), auth);
        let response = send(request).await?;
        let body = response.text().await.map_err(network_error)?;
        parse_exposition(&body)
    }

    /// Fetch a process snapshot body verbatim. The body is not validated here.
    pub async fn fetch_process_snapshot(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = send(self.client.get(url).timeout(self.timeout)).await?;
        let body = response.bytes().await.map_err(network_error)?;
        Ok(body.to_vec())
    }

    /// Stream a log endpoint, calling `on_line` for each line as it arrives.
    ///
    /// Returns `Ok(())` when the remote closes the stream cleanly.
    pub async fn tail_log<F>(
        &self,
        url: &str,
        auth: Option<&BasicAuth>,
        mut on_line: F,
    ) -> Result<(), FetchError>
    where
        F: FnMut(&str),
    {
        let request = with_auth(
            self.client.get(url).header(ACCEPT, "text/event-stream"),
            auth,
        );
        let mut response = send(request).await?;

        let mut lines = LineBuffer::default();
        while let Some(chunk) = response.chunk().await.map_err(network_error)? {
            lines.push(&chunk, &mut on_line);
        }
        lines.finish(&mut on_line);

        Ok(())
    }
}

async fn send(request: RequestBuilder) -> Result<Response, FetchError> {
    let response = request.send().await.map_err(network_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    Ok(response)
}

fn with_auth(request: RequestBuilder, auth: Option<&BasicAuth>) -> RequestBuilder {
    match auth {
        Some(auth) if !auth.username.is_empty() => {
            request.basic_auth(&auth.username, Some(&auth.password))
        }
        _ => request,
    }
}

fn network_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Network(format!("timed out: {}", e))
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Reassembles newline-terminated lines from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// The current line was already delivered in part by a forced flush.
    split: bool,
}

impl LineBuffer {
    /// Feed one chunk, emitting every line it completes.
    pub fn push<F: FnMut(&str)>(&mut self, chunk: &[u8], on_line: &mut F) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            // A newline right after a forced flush only ends the line.
            if self.split && matches!(self.pending.as_slice(), [] | [b'\r']) {
                self.pending.clear();
            } else {
                self.emit(on_line);
            }
            self.split = false;
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);

        if self.pending.len() > MAX_LINE_BYTES {
            self.flush_long(on_line);
        }
    }

    /// Emit a trailing unterminated line, if any.
    pub fn finish<F: FnMut(&str)>(&mut self, on_line: &mut F) {
        if !self.pending.is_empty() {
            self.emit(on_line);
        }
        self.split = false;
    }

    /// Deliver an over-long line so far, holding back a trailing partial
    /// UTF-8 sequence for the next piece.
    fn flush_long<F: FnMut(&str)>(&mut self, on_line: &mut F) {
        let cut = match std::str::from_utf8(&self.pending) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => self.pending.len(),
        };
        let tail = self.pending.split_off(cut);
        self.emit(on_line);
        self.pending = tail;
        self.split = true;
    }

    fn emit<F: FnMut(&str)>(&mut self, on_line: &mut F) {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending);
        on_line(&line);
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{header, HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Router,
    };

    fn collect(chunks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut buffer = LineBuffer::default();
        let mut on_line = |line: &str| lines.push(line.to_string());
        for chunk in chunks {
            buffer.push(chunk, &mut on_line);
        }
        buffer.finish(&mut on_line);
        lines
    }

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        assert_eq!(
            collect(&[b"[api] hel", b"lo\n[api] wor", b"ld\r\nplain\n"]),
            vec!["[api] hello", "[api] world", "plain"]
        );
        assert_eq!(collect(&[b"a\n\nb"]), vec!["a", "", "b"]);
        assert!(collect(&[b""]).is_empty());
    }

    #[test]
    fn test_line_buffer_caps_line_length() {
        let big = vec![b'x'; MAX_LINE_BYTES + 10];

        let lines = collect(&[&big, b"\nnext\n"]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES + 10);
        assert_eq!(lines[1], "next");

        let lines = collect(&[&big, b"\r\n", b"\nafter"]);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "");
        assert_eq!(lines[2], "after");

        // Bytes after the flush continue the same line.
        let lines = collect(&[&big, b"yy\nnext\n"]);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "yy");
        assert_eq!(lines[2], "next");
    }

    #[test]
    fn test_line_buffer_flush_keeps_utf8_intact() {
        let mut first = vec![b'x'; MAX_LINE_BYTES];
        first.extend_from_slice(&"é".as_bytes()[..1]);
        let mut second = "é".as_bytes()[1..].to_vec();
        second.extend_from_slice(b"tail\n");

        let lines = collect(&[&first, &second]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert!(lines[0].bytes().all(|b| b == b'x'));
        assert_eq!(lines[1], "étail");
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn requires_auth(headers: &HeaderMap) -> bool {
        // "user:pass"
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some("Basic dXNlcjpwYXNz")
    }

    fn target_router() -> Router {
        Router::new()
            .route(
                "/metrics",
                get(|headers: HeaderMap| async move {
                    if !requires_auth(&headers) {
                        return StatusCode::UNAUTHORIZED.into_response();
                    }
                    "# TYPE up gauge\nup 1\n".into_response()
                }),
            )
            .route("/bad-metrics", get(|| async { "up{ 1\n" }))
            .route("/processes", get(|| async { r#"[{"name":"api"}]"# }))
            .route(
                "/logs",
                get(|headers: HeaderMap| async move {
                    if headers.get(header::ACCEPT).and_then(|v| v.to_str().ok())
                        != Some("text/event-stream")
                    {
                        return StatusCode::NOT_ACCEPTABLE.into_response();
                    }
                    "[api] one\r\n[api] two\nthree".into_response()
                }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
    }

    fn auth() -> BasicAuth {
        BasicAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_metrics() {
        let base = serve(target_router()).await;
        let fetcher = TargetFetcher::new(Duration::from_secs(5)).unwrap();

        let families = fetcher
            .fetch_metrics(&format!("{}/metrics", base), Some(&auth()))
            .await
            .unwrap();
        assert_eq!(families["up"].samples[0].value, 1.0);

        let err = fetcher
            .fetch_metrics(&format!("{}/metrics", base), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(401)));

        let err = fetcher
            .fetch_metrics(&format!("{}/bad-metrics", base), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[tokio::test]
    async fn test_fetch_process_snapshot() {
        let base = serve(target_router()).await;
        let fetcher = TargetFetcher::new(Duration::from_secs(5)).unwrap();

        let body = fetcher
            .fetch_process_snapshot(&format!("{}/processes", base))
            .await
            .unwrap();
        assert_eq!(body, br#"[{"name":"api"}]"#);

        let err = fetcher
            .fetch_process_snapshot(&format!("{}/missing", base))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }

    #[tokio::test]
    async fn test_tail_log() {
        let base = serve(target_router()).await;
        let fetcher = TargetFetcher::new(Duration::from_secs(5)).unwrap();

        let mut lines = Vec::new();
        fetcher
            .tail_log(&format!("{}/logs", base), None, |line| lines.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(lines, vec!["[api] one", "[api] two", "three"]);

        let err = fetcher
            .tail_log(&format!("{}/missing", base), None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = TargetFetcher::new(Duration::from_secs(1)).unwrap();
        let err = fetcher
            .fetch_metrics(&format!("http://{}/metrics", addr), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }
}
