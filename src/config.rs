//! Process configuration, resolved from the environment.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::store::DATA_DIR;

/// Runtime configuration for the broker process.
///
/// Everything falls back from environment variables to hardcoded defaults;
/// `.env` values are loaded by the entrypoint before this is read.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// When set, every non-read tool operation answers *write-disabled*.
    pub demo_mode: bool,
    /// Directory holding `state.json`.
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            host: defaults::host(),
            port: defaults::port(),
            demo_mode: parse_flag(std::env::var("DEMO_MODE").ok()),
            data_dir: defaults::data_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: defaults::DEFAULT_HOST.parse().expect("valid default host"),
            port: defaults::DEFAULT_PORT,
            demo_mode: false,
            data_dir: PathBuf::from(DATA_DIR),
        }
    }
}

mod defaults {
    use super::*;
    use std::env;

    pub const DEFAULT_PORT: u16 = 3000;
    pub const DEFAULT_HOST: &str = "127.0.0.1";

    /// $PORT -> 3000
    pub fn port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// $HOST -> 127.0.0.1
    pub fn host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_HOST.parse().expect("valid default host"))
    }

    /// $CLAWLET_DIR -> <cwd>/.clawlet
    pub fn data_dir() -> PathBuf {
        env::var("CLAWLET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DATA_DIR))
    }
}

fn parse_flag(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim),
        Some("true") | Some("1") | Some("TRUE") | Some("True")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host.to_string(), "127.0.0.1");
        assert!(!config.demo_mode);
        assert_eq!(config.data_dir, PathBuf::from(".clawlet"));
    }

    #[test]
    fn demo_flag_parsing() {
        assert!(parse_flag(Some("true".into())));
        assert!(parse_flag(Some(" 1".into())));
        assert!(!parse_flag(Some("false".into())));
        assert!(!parse_flag(Some("yes".into())));
        assert!(!parse_flag(None));
    }
}
