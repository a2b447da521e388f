pub mod types;

use anyhow::{Context, Result};
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load and validate configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    validate_server(config)?;
    validate_session(config)?;
    Ok(())
}

fn validate_server(config: &AppConfig) -> Result<()> {
    let server = &config.server;
    if server.listen_address.is_empty() {
        anyhow::bail!("server.listen_address must not be empty");
    }
    if server.port == 0 {
        anyhow::bail!("server.port must be > 0");
    }
    if server.instances == 0 {
        anyhow::bail!("server.instances must be >= 1");
    }
    if !server.server_id.starts_with("SSH-2.0-") {
        anyhow::bail!(
            "server.server_id must start with 'SSH-2.0-' (got '{}')",
            server.server_id
        );
    }
    if !(1..=10_000).contains(&server.poll_interval_ms) {
        anyhow::bail!(
            "server.poll_interval_ms must be between 1 and 10000 (got {})",
            server.poll_interval_ms
        );
    }
    if server.cleanup_passes == 0 {
        anyhow::bail!("server.cleanup_passes must be >= 1");
    }
    Ok(())
}

fn validate_session(config: &AppConfig) -> Result<()> {
    let session = &config.session;
    if session.handshake_timeout_secs == 0 {
        anyhow::bail!("session.handshake_timeout_secs must be > 0");
    }
    if session.channel_timeout_secs == 0 {
        anyhow::bail!("session.channel_timeout_secs must be > 0");
    }
    if session.outbox_capacity == 0 {
        anyhow::bail!("session.outbox_capacity must be >= 1");
    }
    Ok(())
}
