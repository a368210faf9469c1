// peerlink daemon: cluster listener, endpoint dialer and keep-alive timer.

mod config;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use peerlink_core::{ApiService, RpcFunctionRegistry, LOG_TARGET};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerlink-daemon {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let cfg = config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let topology = cfg.build_topology().context("invalid cluster topology")?;
    let service = ApiService::new(Arc::new(topology), RpcFunctionRegistry::with_builtins());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind((cfg.listen_host.as_str(), cfg.listen_port))
            .await
            .with_context(|| format!("binding {}:{}", cfg.listen_host, cfg.listen_port))?;
        info!(
            target: LOG_TARGET,
            identity = %cfg.identity,
            zone = cfg.local_zone(),
            "Listening on {}:{}", cfg.listen_host, cfg.listen_port
        );

        let supervisor = service.spawn_supervisor();
        let accept = tokio::spawn(transport::run_listener(
            service.clone(),
            listener,
            cfg.identity.clone(),
        ));
        let dialer = tokio::spawn(transport::run_reconnect(
            service.clone(),
            cfg.identity.clone(),
            Duration::from_secs(cfg.reconnect_interval_secs.max(1)),
        ));

        shutdown_signal().await?;
        info!(target: LOG_TARGET, "Shutting down");
        supervisor.abort();
        accept.abort();
        dialer.abort();
        service.shutdown().await;
        anyhow::Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
