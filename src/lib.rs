pub mod auth;
pub mod config;
pub mod history;
pub mod ingest;
pub mod output;
pub mod server;
pub mod snapshot;
pub mod source;
