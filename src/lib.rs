pub mod cli;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod ingest;
pub mod migrate;
pub mod quantity;
pub mod query;
pub mod routes;
pub mod schema;
pub mod state;
pub mod stats;
pub mod stream;
pub mod summarize;
pub mod telemetry;
