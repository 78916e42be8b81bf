//! contrail - telemetry collector
//!
//! Scrapes metrics, process snapshots, and log streams from remote agents
//! into a sharded flat-file store and serves them over HTTP.

pub mod config;
pub mod db;
pub mod fetch;
pub mod pm2;
pub mod scheduler;
pub mod web;
