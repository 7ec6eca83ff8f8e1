pub mod auth;
pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod db;
pub mod definitions;
pub mod error;
pub mod history;
pub mod mapper;
pub mod models;
pub mod pagination;
pub mod query;
pub mod reports;
pub mod routes;
pub mod schema;
pub mod server;
pub mod service;
pub mod state;
pub mod stats;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the report query service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
