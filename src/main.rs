mod alert;
mod auth;
mod catalog;
mod cli;
mod config;
mod cutouts;
mod decode;
mod filters;
mod http;
mod ml;
mod skyportal;
mod spatial;
mod supervisor;
mod worker;
mod xmatch;

use crate::cli::Args;
use crate::config::Config;
use crate::supervisor::Supervisor;
use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,alert_ingester=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;
    let config = Arc::new(Config::load(args.config.as_deref())?);

    let status = supervisor::new_status_board();

    let ops_handle = if let Some(server_config) = &config.server {
        let state = http::AppState {
            status: status.clone(),
            gateway: catalog::CatalogGateway::connect(&config.database).await?,
            auth: auth::AuthSettings::from_config(server_config)?,
            collection_filters: config.database.collection_filters.clone(),
            collection_alerts: config.database.collection_alerts.clone(),
        };
        let bind = format!("{}:{}", server_config.host, server_config.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        tracing::info!(bind = %bind, "ops API listening");
        Some(tokio::spawn(async move {
            axum::serve(listener, http::router(state)).await.ok();
        }))
    } else {
        None
    };

    let supervisor = Supervisor::new(
        config.clone(),
        status,
        args.obsdate.clone(),
        !args.noio,
        args.test,
    );

    tokio::select! {
        result = supervisor.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // workers are daemons of this process; returning from main stops them
    if let Some(handle) = ops_handle {
        handle.abort();
    }
    Ok(())
}
