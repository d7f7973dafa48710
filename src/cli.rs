use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cooling-monitor",
    version,
    about = "Polls CDU cooling units over SSH and serves their last 24h of temperatures"
)]
pub struct Args {
    /// Device inventory file; overrides COOLING_INVENTORY_PATH.
    #[arg(long)]
    pub inventory: Option<PathBuf>,
    /// Address for the read-only HTTP API; overrides COOLING_HTTP_BIND.
    #[arg(long)]
    pub http_bind: Option<String>,
    /// Run a single sweep, print the device summaries as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
}

impl Args {
    pub fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.inventory {
            config.inventory_path = path.clone();
        }
        if let Some(bind) = &self.http_bind {
            config.http_bind = bind.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() -> anyhow::Result<()> {
        let mut config = Config::from_lookup(|key| match key {
            "SSH_USERNAME" => Some("admin".to_string()),
            "SSH_PASSWORD" => Some("secret".to_string()),
            _ => None,
        })?;
        let args = Args::try_parse_from([
            "cooling-monitor",
            "--inventory",
            "/etc/cooling/callans.json",
            "--http-bind",
            "0.0.0.0:9000",
            "--once",
        ])?;
        args.apply(&mut config);
        assert!(args.once);
        assert_eq!(config.inventory_path, PathBuf::from("/etc/cooling/callans.json"));
        assert_eq!(config.http_bind, "0.0.0.0:9000");
        Ok(())
    }
}
