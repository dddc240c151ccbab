use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

fn default_interface() -> String {
    "can0".to_owned()
}

fn default_link_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_ping_interval() -> u64 {
    1000
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(rename = "link-dir", default = "default_link_dir")]
    pub link_dir: PathBuf,
    #[serde(rename = "ping-interval-ms", default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            interface: default_interface(),
            link_dir: default_link_dir(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        Ok(serde_yaml::from_reader(&mut File::open(path)?)?)
    }

    /// Link names carry the bus they belong to: can0 publishes
    /// `ttyCAN0_<uuid>`.
    pub fn link_prefix(&self) -> String {
        format!("tty{}_", self.interface.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/canserd.yaml")).unwrap();
        assert_eq!(config.interface, "can0");
        assert_eq!(config.link_dir, PathBuf::from("/tmp"));
        assert_eq!(config.ping_interval_ms, 1000);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: Config = serde_yaml::from_str("interface: vcan1\n").unwrap();
        assert_eq!(config.interface, "vcan1");
        assert_eq!(config.ping_interval_ms, 1000);
        assert_eq!(config.link_prefix(), "ttyVCAN1_");
    }

    #[test]
    fn link_prefix_tracks_the_interface() {
        assert_eq!(Config::default().link_prefix(), "ttyCAN0_");
    }
}
