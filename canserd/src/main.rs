use std::path::Path;
use std::time::Duration;

use canserd::{Config, Gateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = Config::load(Path::new("canserd.yaml"))?;
    log::info!(
        "Bridging {} into {}/{}*",
        config.interface,
        config.link_dir.display(),
        config.link_prefix()
    );

    let mut gateway = Gateway::open(&config)?;

    let mut ticker = tokio::time::interval(Duration::from_millis(config.ping_interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = gateway.ping() {
                    log::error!("{}", e);
                    log::debug!("Details: {:?}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    log::info!("Shutting down");
    gateway.shutdown();
    Ok(())
}
