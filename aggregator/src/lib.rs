pub mod api;
pub mod config;
pub mod consumer;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod publish;
pub mod read;
pub mod router;
pub mod server;
pub mod store;
