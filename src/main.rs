use anyhow::{bail, Context, Result};
use rabrpc::config::{find_config_file, load_config};
use rabrpc::env::EnvOverrides;
use rabrpc::{transform_config, RabRpc, SimplifiedConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: rabrpc <transform|connect> [config.json]";

fn load(path: Option<String>) -> Result<SimplifiedConfig> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None => find_config_file()?,
    };
    info!("Loading configuration from {}", path.display());

    let mut config = load_config(&path)?;
    let overrides = EnvOverrides::load()?;
    if !overrides.is_empty() {
        info!(?overrides, "Applying environment overrides");
        overrides.apply(&mut config);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next();
    let path = args.next();

    match command.as_deref() {
        Some("transform") => {
            let config = load(path)?;
            let expanded = transform_config(&config).context("Failed to transform configuration")?;
            println!("{}", serde_json::to_string_pretty(&expanded)?);
        }
        Some("connect") => {
            let config = load(path)?;
            let rpc = RabRpc::rabbitmq();
            rpc.configure(&config).await.context("Failed to configure RabbitMQ")?;

            info!("Service running. Press Ctrl+C to exit.");
            tokio::signal::ctrl_c().await?;

            info!("Shutting down...");
            rpc.shutdown().await?;
        }
        _ => bail!(USAGE),
    }

    Ok(())
}
