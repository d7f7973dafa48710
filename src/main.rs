use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cooling_monitor::config::Config;
use cooling_monitor::extract::LabelExtractor;
use cooling_monitor::scheduler::Scheduler;
use cooling_monitor::session::ssh::SshTransport;
use cooling_monitor::{cli, http, inventory};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cooling_monitor=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind cooling-monitor HTTP listener on {addr}: port already in use. Stop the other service or re-run with --http-bind to choose another address.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind cooling-monitor HTTP listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    dotenvy::dotenv().ok();
    init_tracing()?;

    let mut config = Config::from_env()?;
    args.apply(&mut config);

    let devices = inventory::load_inventory(&config.inventory_path)?;
    tracing::info!(
        devices = devices.len(),
        path = %config.inventory_path.display(),
        "loaded device inventory"
    );
    let extractor = LabelExtractor::new(&config.air_label, &config.liquid_label)
        .context("invalid metric labels")?;

    let mut scheduler = Scheduler::new(
        devices,
        Arc::new(SshTransport::new()),
        Arc::new(extractor),
        config.credentials.clone(),
        config.poll.clone(),
        config.schedule.clone(),
    );
    let sink = scheduler.sink();

    if args.once {
        let report = scheduler.sweep().await?;
        tracing::info!(polled = report.polled, failed = report.failed, "single sweep complete");
        println!(
            "{}",
            serde_json::to_string_pretty(&http::device_summaries(&sink))?
        );
        return Ok(());
    }

    let listener = bind_listener(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "cooling-monitor HTTP listening");
    let app = http::router(http::HttpState { sink });
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    let cancel = CancellationToken::new();
    let mut scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &mut scheduler_handle => {
            // The scheduler only returns on its own when something escaped
            // the per-device boundary.
            return match res {
                Ok(Ok(())) => Err(anyhow!("poll scheduler exited unexpectedly")),
                Ok(Err(err)) => {
                    tracing::error!(error = %format!("{err:#}"), "poll scheduler failed");
                    Err(err)
                }
                Err(err) => {
                    tracing::error!(error = %err, "poll scheduler task panicked");
                    Err(anyhow!("poll scheduler task panicked: {err}"))
                }
            };
        }
        res = http_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("HTTP server exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "HTTP server failed"),
                Err(err) => tracing::error!(error = %err, "HTTP task panicked"),
            }
        }
    }

    cancel.cancel();
    match scheduler_handle.await {
        Ok(result) => result,
        Err(err) => Err(anyhow!("poll scheduler task panicked: {err}")),
    }
}
