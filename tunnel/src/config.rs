use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use secrecy::SecretString;
use serde::Deserialize;

use crate::DEFAULT_TIME_TO_LIVE;

/// Client protocol spoken on the local listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Socks5,
    Http,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Socks5 => write!(f, "socks5"),
            Proto::Http => write!(f, "http"),
        }
    }
}

impl FromStr for Proto {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socks5" => Ok(Proto::Socks5),
            "http" => Ok(Proto::Http),
            other => bail!("proto {other} not supported, use 'socks5' or 'http'"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// e.g. `tcp://0.0.0.0:3810`
    pub listen: String,
    /// Comma-separated WebSocket URLs, e.g. `ws://127.0.0.1:3811/ws`.
    pub remotes: String,
    pub password: SecretString,
    pub proto: Proto,
    /// Seconds before a tunnel's WebSocket is preemptively rotated.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl LocalConfig {
    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn remote_urls(&self) -> Vec<String> {
        self.remotes
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// e.g. `tcp://0.0.0.0:3811`
    pub listen: String,
    pub password: SecretString,
}

fn default_ttl_secs() -> u64 {
    DEFAULT_TIME_TO_LIVE.as_secs()
}

/// Splits a `network://address` listen string.
pub(crate) fn split_listen(listen: &str) -> Result<(&str, &str)> {
    let (network, address) = listen
        .split_once("://")
        .with_context(|| format!("listen address `{listen}` is not of the form network://host:port"))?;

    if !matches!(network, "tcp" | "tcp4" | "tcp6") {
        bail!("listen network `{network}` is not supported, only tcp");
    }

    Ok((network, address))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_config_shape() {
        let config = serde_json::from_str::<LocalConfig>(
            r#"{
                "listen": "tcp://0.0.0.0:3810",
                "remotes": "ws://127.0.0.1:3811/ws,ws://127.0.0.1:3812/ws",
                "password": "pass123",
                "proto": "socks5"
            }"#,
        )
        .unwrap();

        assert_eq!(config.remote_urls().len(), 2);
        assert_eq!(config.proto, Proto::Socks5);
        assert_eq!(config.time_to_live(), DEFAULT_TIME_TO_LIVE);
    }

    #[test]
    fn splits_listen_addresses() {
        assert_eq!(
            split_listen("tcp://0.0.0.0:3810").unwrap(),
            ("tcp", "0.0.0.0:3810")
        );
        assert!(split_listen("3810").is_err());
        assert!(split_listen("udp://0.0.0.0:3810").is_err());
    }

    #[test]
    fn proto_round_trips_through_display() {
        for proto in [Proto::Socks5, Proto::Http] {
            assert_eq!(proto.to_string().parse::<Proto>().unwrap(), proto);
        }
    }
}
