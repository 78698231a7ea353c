//! Relay server binary.
//!
//! Run with: cargo run -p relay-server -- --help

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use relay_node::Node;
use relay_server::{
    Config, Listeners, MetricsEndpoint, SessionLifecycle, ShutdownCoordinator, metrics, server,
    wait_for_signal,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::parse();
    let handle = metrics::install_recorder().context("failed to install metrics recorder")?;

    let node = Node::new(config.node_config()).context("failed to create node")?;
    node.on_connect(SessionLifecycle::new(config.event_logging()))?;
    node.run().context("failed to start node")?;

    let resolver = config.identity_resolver()?;
    let listeners = Listeners::bind(&config).await?;
    tracing::info!(
        websocket = %config.websocket_addr(),
        stream = %config.stream_addr(),
        metrics = %config.metrics_path,
        "listening"
    );

    let metrics = MetricsEndpoint {
        path: config.metrics_path.clone(),
        handle,
    };
    let server = tokio::spawn(server::serve(node.clone(), listeners, resolver, Some(metrics)));

    let coordinator = ShutdownCoordinator::new(node.clone(), config.shutdown_timeout());
    let drained = tokio::select! {
        result = coordinator.run(wait_for_signal()) => result,
        fatal = node.fatal_error() => {
            tracing::error!("{fatal}");
            std::process::exit(1);
        }
    };

    if let Err(e) = drained {
        tracing::error!("{e}");
        println!("exiting");
        return Ok(ExitCode::FAILURE);
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Server error: {e}"),
        Err(e) => tracing::error!("Server task failed: {e}"),
    }

    println!("exiting");
    Ok(ExitCode::SUCCESS)
}
