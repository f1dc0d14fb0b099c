use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use kestrel_agent::settings::Settings;

const DEFAULT_BIND: &str = "127.0.0.1:9010";

/// Startup configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind: SocketAddr,
    pub project_path: PathBuf,
    pub settings: Settings,
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("KESTREL_BIND")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("KESTREL_BIND is not a socket address: {bind}"))?;

        let project_path = match std::env::var_os("KESTREL_PROJECT_PATH") {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => std::env::current_dir().context("resolve current directory")?,
        };

        Ok(Self {
            bind,
            project_path,
            settings: Settings::from_env(),
        })
    }
}
