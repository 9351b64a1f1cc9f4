//! Bridge binary.
//!
//! Connects to every configured lighting device, elects one connection as
//! the mesh primary, polls mesh status on it, and logs each device as JSON.

use anyhow::{Context, Result};
use bridge_devices::{DeviceError, DeviceOperations, DeviceOpsConfig, MeshResponse};
use bridge_session::{
    ConnectionManager, ConnectionState, InMemoryMetrics, ReliableTransport, TcpConnector,
};
use clap::Parser;
use futures::future::join_all;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{BridgeConfig, ConnectionSpec};
use logging::BridgeLogFormatter;

#[cfg(feature = "tls")]
use bridge_session::{make_client_config, ClientIdentity, TlsSettings};

/// On-prem bridge for WiFi lighting devices
#[derive(Parser, Debug)]
#[command(name = "light-bridge", version, about = "On-prem bridge for WiFi lighting devices")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "bridge.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Mesh poll interval, e.g. 60s
    #[arg(long)]
    poll_interval: Option<humantime::Duration>,

    /// Name of the connection allowed to issue mesh queries
    #[arg(long)]
    primary: Option<String>,

    /// Poll the mesh once, then exit
    #[arg(long)]
    once: bool,
}

/// One device connection and the operations bound to it
struct Link {
    name: String,
    spec: ConnectionSpec,
    manager: ConnectionManager,
    ops: Arc<DeviceOperations>,
}

impl Link {
    async fn connect(&self) -> bool {
        match self
            .manager
            .connect(self.spec.endpoint, self.spec.auth_code.clone())
            .await
        {
            Ok(true) => {
                component_info!("connection", connection = %self.name, "connected");
                true
            }
            Ok(false) => {
                component_warn!("connection", connection = %self.name, "connect attempts exhausted");
                false
            }
            Err(e) => {
                component_error!(
                    "connection",
                    connection = %self.name,
                    error = %e,
                    "connect failed"
                );
                false
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load_from_file(&args.config)?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(interval) = args.poll_interval {
        config.poll_interval = interval.into();
    }
    if let Some(primary) = &args.primary {
        config.set_primary(primary)?;
    }

    init_tracing(&config.log_level)?;

    info!("Starting light-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration {:?}: {} connection(s), poll every {}",
        args.config,
        config.connections.len(),
        humantime::format_duration(config.poll_interval)
    );

    let primary = config
        .primary_index()
        .with_context(|| format!("no connections configured in {:?}", args.config))?;

    let metrics = Arc::new(InMemoryMetrics::new());
    let mut links = Vec::with_capacity(config.connections.len());
    for (index, spec) in config.connections.iter().enumerate() {
        let connector = build_connector(spec).await?;
        let manager = ConnectionManager::new(
            spec.name.clone(),
            Arc::new(connector),
            config.connection.clone(),
            metrics.clone(),
        );
        let transport = Arc::new(ReliableTransport::new(
            Arc::new(manager.clone()),
            metrics.clone(),
        ));
        let ops_config = DeviceOpsConfig {
            cache_capacity: config.cache_capacity,
            ..DeviceOpsConfig::from_timeouts(&config.connection.timeouts)
        };
        let ops = Arc::new(DeviceOperations::new(transport, ops_config, metrics.clone()));
        ops.set_primary(index == primary);

        links.push(Link {
            name: spec.name.clone(),
            spec: spec.clone(),
            manager,
            ops,
        });
    }
    let links = Arc::new(links);
    component_info!("devices", "Primary connection: {}", links[primary].name);

    let connected = join_all(links.iter().map(|link| link.connect())).await;
    info!(
        "{}/{} connection(s) established",
        connected.iter().filter(|ok| **ok).count(),
        links.len()
    );

    let mut poller = tokio::spawn(poll_loop(
        links.clone(),
        primary,
        config.poll_interval,
        args.once,
    ));
    let reporter = tokio::spawn(report_loop(
        links.clone(),
        metrics.clone(),
        config.metrics_interval,
    ));

    let poller_finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
            }
            false
        }
        _ = &mut poller => {
            debug!("Poller finished");
            true
        }
    };

    if !poller_finished {
        poller.abort();
        let _ = poller.await;
    }
    reporter.abort();
    let _ = reporter.await;

    info!("Bridge shutting down");
    join_all(links.iter().map(|link| link.manager.disconnect())).await;
    log_metrics(&links, &metrics);

    info!("Bridge shutdown complete");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let env_filter = EnvFilter::new("info")
        .add_directive(format!("light_bridge={}", level).parse()?)
        .add_directive(format!("bridge_session={}", level).parse()?)
        .add_directive(format!("bridge_devices={}", level).parse()?)
        .add_directive(format!("bridge_wire={}", level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(BridgeLogFormatter::new("bridge"))
        .init();
    Ok(())
}

async fn build_connector(spec: &ConnectionSpec) -> Result<TcpConnector> {
    let connector = TcpConnector::new(spec.address.clone());
    if !spec.tls.enabled {
        return Ok(connector);
    }

    secure(connector, spec).await
}

#[cfg(not(feature = "tls"))]
async fn secure(_connector: TcpConnector, spec: &ConnectionSpec) -> Result<TcpConnector> {
    anyhow::bail!(
        "connection {:?} enables TLS but this binary was built without the tls feature",
        spec.name
    )
}

#[cfg(feature = "tls")]
async fn secure(connector: TcpConnector, spec: &ConnectionSpec) -> Result<TcpConnector> {
    Ok(connector.with_tls(tls_settings(spec).await?))
}

#[cfg(feature = "tls")]
async fn tls_settings(spec: &ConnectionSpec) -> Result<TlsSettings> {
    let ca_path = spec
        .tls
        .ca_file
        .as_ref()
        .with_context(|| format!("connection {:?}: tls.ca_file is required", spec.name))?;
    let ca_pem = tokio::fs::read_to_string(ca_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read CA file {:?}: {}", ca_path, e))?;

    let identity_pems = match (&spec.tls.cert_file, &spec.tls.key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = tokio::fs::read_to_string(cert_path).await.map_err(|e| {
                anyhow::anyhow!("Failed to read certificate file {:?}: {}", cert_path, e)
            })?;
            let key_pem = tokio::fs::read_to_string(key_path).await.map_err(|e| {
                anyhow::anyhow!("Failed to read private key file {:?}: {}", key_path, e)
            })?;
            Some((cert_pem, key_pem))
        }
        (None, None) => None,
        _ => anyhow::bail!(
            "connection {:?}: tls.cert_file and tls.key_file must be set together",
            spec.name
        ),
    };
    let identity = identity_pems.as_ref().map(|(cert, key)| ClientIdentity {
        cert_chain_pem: cert,
        private_key_pem: key,
    });

    let client_config = make_client_config(&ca_pem, identity)?;
    Ok(TlsSettings {
        config: Arc::new(client_config),
        server_name: spec
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| spec.host().to_string()),
    })
}

/// Poll mesh status on the primary; redial links that dropped to Disconnected
async fn poll_loop(links: Arc<Vec<Link>>, primary: usize, every: Duration, once: bool) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let idle: Vec<&Link> = links
            .iter()
            .filter(|link| link.manager.state() == ConnectionState::Disconnected)
            .collect();
        if !idle.is_empty() {
            join_all(idle.into_iter().map(|link| link.connect())).await;
        }

        poll_mesh(&links[primary]).await;
        if once {
            break;
        }
    }
}

async fn poll_mesh(link: &Link) {
    if !link.manager.is_connected() {
        component_warn!("devices", connection = %link.name, "primary not connected, skipping mesh poll");
        return;
    }

    match link.ops.ask_for_mesh_info(true, None).await {
        Ok(MeshResponse::Parsed(devices)) => {
            component_info!(
                "devices",
                connection = %link.name,
                "mesh poll returned {} device(s), {} cached",
                devices.len(),
                link.ops.cache_len()
            );
            for device in &devices {
                match serde_json::to_string(device) {
                    Ok(json) => component_info!("devices", device = %device.hex_id(), "{}", json),
                    Err(e) => warn!(device = %device.hex_id(), "failed to serialize device: {}", e),
                }
            }
        }
        Ok(MeshResponse::Raw(frames)) => {
            debug!("mesh poll returned {} raw frame(s)", frames.len());
        }
        Err(DeviceError::QueryNotAcknowledged { reason, .. }) => {
            component_warn!("devices", connection = %link.name, reason, "mesh query not acknowledged");
        }
        Err(e) => {
            component_error!("devices", connection = %link.name, error = %e, "mesh poll failed");
        }
    }
}

async fn report_loop(links: Arc<Vec<Link>>, metrics: Arc<InMemoryMetrics>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        log_metrics(&links, &metrics);
    }
}

fn log_metrics(links: &[Link], metrics: &InMemoryMetrics) {
    for link in links {
        match serde_json::to_string(&link.manager.stats()) {
            Ok(stats) => component_info!(
                "metrics",
                connection = %link.name,
                state = %link.manager.state(),
                "{}",
                stats
            ),
            Err(e) => warn!("failed to serialize connection stats: {}", e),
        }
    }
    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => component_info!("metrics", "{}", snapshot),
        Err(e) => warn!("failed to serialize metrics snapshot: {}", e),
    }
}
