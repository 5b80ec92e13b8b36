//! HTTP API: server, routing, and request/response mapping for the job pipeline.

pub mod app;
