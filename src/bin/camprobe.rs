//! camprobe - one-shot camera transport diagnostic
//!
//! Prints the ordered candidate list for a camera, runs a single probing pass and reports
//! every attempt. Exits non-zero when no candidate produced a frame.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camrelay::{generate_candidates, probe, Connector, NetworkConnector, RelayConfig};

#[derive(Parser, Debug)]
#[command(
    name = "camprobe",
    version,
    about = "List and test a camera's candidate stream URLs"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CAMRELAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Camera host, overrides the configuration.
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Per-candidate timeout in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Only print the candidate list.
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load()?,
    };
    if let Some(host) = args.host {
        config.camera.host = host;
    }
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(config.supervisor.probe_timeout);

    let endpoint = config.endpoint()?;
    let candidates = generate_candidates(&endpoint)?;
    println!(
        "{} ({}) - {} candidates",
        endpoint.host(),
        endpoint.model(),
        candidates.len()
    );
    for (index, candidate) in candidates.iter().enumerate() {
        println!("  {:>2}. [{}] {}", index + 1, candidate.scheme, candidate.url);
    }
    if args.list {
        return Ok(());
    }

    println!("probing with {}s per candidate...", timeout.as_secs());
    let connector: Arc<dyn Connector> =
        Arc::new(NetworkConnector::new(endpoint.credentials().clone()));
    match probe(&connector, &candidates, timeout) {
        Ok(success) => {
            for failure in &success.rejected {
                println!("  FAIL {failure}");
            }
            println!(
                "  OK   {} ({}) {}x{}",
                success.candidate.url,
                success.candidate.scheme,
                success.first_image.width,
                success.first_image.height
            );
            Ok(())
        }
        Err(err) => {
            for failure in &err.attempts {
                println!("  FAIL {failure}");
            }
            Err(anyhow!("{err}"))
        }
    }
}
