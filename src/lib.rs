//! Image Generation Pipeline
//!
//! Accepts image generation requests behind a per-user daily quota, queues
//! them for asynchronous processing against a generative image model, and
//! records each job's lifecycle in a durable store. The HTTP API, the queue
//! worker and the re-drive pass are separate binaries sharing this library.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
