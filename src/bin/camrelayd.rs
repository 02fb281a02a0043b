//! camrelayd - camera relay daemon
//!
//! This daemon:
//! 1. Loads the relay configuration (file, environment, flags)
//! 2. Probes the camera's candidate transports and supervises the connection
//! 3. Serves the multiplexed MJPEG stream, snapshots and status over HTTP
//! 4. Stops cleanly on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use camrelay::{
    api::{ApiConfig, ApiServer, RelayServices},
    CameraContext, Connector, NetworkConnector, ReconnectSupervisor, RelayConfig,
    SnapshotService, StreamMultiplexer, SyntheticConnector,
};

/// Host name that selects the synthetic transport.
const SYNTHETIC_HOST: &str = "stub";

#[derive(Parser, Debug)]
#[command(
    name = "camrelayd",
    version,
    about = "Discover a camera's stream transport and relay it as MJPEG"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CAMRELAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Camera host, overrides the configuration.
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// HTTP listen address, overrides the configuration.
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,

    /// Serve a generated test pattern instead of a real camera.
    #[arg(long)]
    synthetic: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load()?,
    };
    if let Some(host) = args.host {
        config.camera.host = host;
    }
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }

    let endpoint = config.endpoint()?;
    let synthetic = args.synthetic || endpoint.host() == SYNTHETIC_HOST;
    let connector: Arc<dyn Connector> = if synthetic {
        log::warn!("using synthetic camera transport");
        Arc::new(SyntheticConnector::demo())
    } else {
        Arc::new(NetworkConnector::new(endpoint.credentials().clone()))
    };

    log::info!(
        "camrelayd {} relaying {} ({}) http:{} rtsp:{}",
        env!("CARGO_PKG_VERSION"),
        endpoint.host(),
        endpoint.model(),
        endpoint.port(),
        endpoint.rtsp_port()
    );

    let context = CameraContext::new(endpoint);
    let supervisor = ReconnectSupervisor::new(
        Arc::clone(&context),
        connector,
        config.supervisor.clone(),
    )?
    .spawn()?;

    let services = RelayServices {
        context: Arc::clone(&context),
        multiplexer: Arc::new(StreamMultiplexer::new(
            Arc::clone(&context),
            config.stream.clone(),
        )),
        snapshots: Arc::new(SnapshotService::new(
            Arc::clone(&context),
            config.snapshot.quality,
            config.snapshot.dir.clone(),
        )),
    };
    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, services)
        .spawn()
        .with_context(|| format!("failed to start api on {}", config.api_addr))?;
    log::info!("stream available at http://{}/stream", api_handle.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("camrelayd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    supervisor.stop()?;
    log::info!(
        "camrelayd stopped after {} frames",
        context.status().frames_total
    );

    Ok(())
}
