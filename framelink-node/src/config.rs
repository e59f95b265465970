//! Load daemon config from file and environment.

use std::path::PathBuf;

use framelink_core::EndpointSettings;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/framelink/config.toml or
/// /etc/framelink/config.toml.
/// Env overrides: FRAMELINK_ROLE, FRAMELINK_HOST, FRAMELINK_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Run as listening server or connecting client (default server).
    #[serde(default)]
    pub role: Role,
    /// Endpoint to listen on or connect to.
    #[serde(default)]
    pub endpoint: EndpointSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Default for Role {
    fn default() -> Self {
        Role::Server
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::default(),
            endpoint: EndpointSettings::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("FRAMELINK_ROLE") {
        match s.to_ascii_lowercase().as_str() {
            "server" => c.role = Role::Server,
            "client" => c.role = Role::Client,
            _ => {}
        }
    }
    if let Ok(s) = std::env::var("FRAMELINK_HOST") {
        c.endpoint.host = s;
    }
    if let Ok(s) = std::env::var("FRAMELINK_PORT") {
        c.endpoint.port = s;
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/framelink/config.toml"));
    }
    out.push(PathBuf::from("/etc/framelink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let c: Config = toml::from_str(
            r#"
            role = "client"

            [endpoint]
            host = "127.0.0.1"
            port = "4500"
            lock_policy = "recursive"
            dispatch_wait_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(c.role, Role::Client);
        assert_eq!(c.endpoint.host, "127.0.0.1");
        assert_eq!(c.endpoint.port, "4500");
        assert_eq!(c.endpoint.dispatch_wait_ms, Some(2000));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.role, Role::Server);
        assert_eq!(c.endpoint.host, "localhost");
        assert_eq!(c.endpoint.port, "80808");
    }
}
