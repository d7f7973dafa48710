use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::extract::{DEFAULT_AIR_LABEL, DEFAULT_LIQUID_LABEL};

pub const DEFAULT_PROMPT_MARKER: &str = "RScmCli#";
pub const DEFAULT_COMMAND: &str = "show cdu fan info";

/// SSH login used for every device. The password is never printed.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: Arc<str>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Arc::from(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-attempt protocol budget shared by every device worker.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub connect_timeout: Duration,
    pub prompt_timeout: Duration,
    /// Pause between reads while the prompt has not shown up yet.
    pub prompt_poll_interval: Duration,
    pub prompt_marker: String,
    pub command: String,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            prompt_timeout: Duration::from_secs(30),
            prompt_poll_interval: Duration::from_millis(100),
            prompt_marker: DEFAULT_PROMPT_MARKER.to_string(),
            command: DEFAULT_COMMAND.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub sweep_interval: Duration,
    pub retention: chrono::Duration,
    pub max_concurrency: usize,
    /// Upper bound on sweeps skipped after repeated failures; 0 disables backoff.
    pub failure_backoff_max_sweeps: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            retention: chrono::Duration::hours(24),
            max_concurrency: 16,
            failure_backoff_max_sweeps: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub inventory_path: PathBuf,
    pub http_bind: String,
    pub credentials: Credentials,

    pub air_label: String,
    pub liquid_label: String,

    pub poll: PollSettings,
    pub schedule: ScheduleSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let inventory_path = PathBuf::from(env_string(
            &lookup,
            "COOLING_INVENTORY_PATH",
            Some("callans.json".to_string()),
        )?);
        let http_bind = env_string(
            &lookup,
            "COOLING_HTTP_BIND",
            Some("127.0.0.1:8090".to_string()),
        )?;

        let username = env_string(&lookup, "SSH_USERNAME", None)?;
        if username.is_empty() {
            bail!("SSH_USERNAME is empty");
        }
        // Passwords are taken verbatim; surrounding whitespace may be significant.
        let password = lookup("SSH_PASSWORD").ok_or_else(|| anyhow!("missing env var SSH_PASSWORD"))?;
        let credentials = Credentials::new(username, password);

        let air_label = env_string(
            &lookup,
            "COOLING_AIR_LABEL",
            Some(DEFAULT_AIR_LABEL.to_string()),
        )?;
        let liquid_label = env_string(
            &lookup,
            "COOLING_LIQUID_LABEL",
            Some(DEFAULT_LIQUID_LABEL.to_string()),
        )?;
        if air_label.is_empty() || liquid_label.is_empty() {
            bail!("metric labels must not be empty");
        }

        let connect_timeout = Duration::from_secs(env_u64(
            &lookup,
            "COOLING_CONNECT_TIMEOUT_SECONDS",
            Some(5),
        )?);
        let prompt_timeout = Duration::from_secs(env_u64(
            &lookup,
            "COOLING_PROMPT_TIMEOUT_SECONDS",
            Some(30),
        )?);
        let prompt_poll_interval = Duration::from_millis(env_u64(
            &lookup,
            "COOLING_PROMPT_POLL_INTERVAL_MS",
            Some(100),
        )?);
        if connect_timeout.is_zero() || prompt_timeout.is_zero() {
            bail!("connect and prompt timeouts must be at least one second");
        }
        if prompt_poll_interval.is_zero() {
            bail!("COOLING_PROMPT_POLL_INTERVAL_MS must be greater than zero");
        }

        let prompt_marker = env_string(
            &lookup,
            "COOLING_PROMPT_MARKER",
            Some(DEFAULT_PROMPT_MARKER.to_string()),
        )?;
        if prompt_marker.is_empty() {
            bail!("COOLING_PROMPT_MARKER must not be empty");
        }
        let command = env_string(&lookup, "COOLING_COMMAND", Some(DEFAULT_COMMAND.to_string()))?;

        let sweep_interval = Duration::from_secs(env_u64(
            &lookup,
            "COOLING_SWEEP_INTERVAL_SECONDS",
            Some(5),
        )?);
        let retention_hours = env_u64(&lookup, "COOLING_RETENTION_HOURS", Some(24))?;
        if retention_hours == 0 {
            bail!("COOLING_RETENTION_HOURS must be at least 1");
        }
        let retention = chrono::Duration::hours(
            i64::try_from(retention_hours).context("COOLING_RETENTION_HOURS out of range")?,
        );
        let max_concurrency = env_u64(&lookup, "COOLING_MAX_CONCURRENCY", Some(16))?.max(1) as usize;
        let failure_backoff_max_sweeps = u32::try_from(env_u64(
            &lookup,
            "COOLING_FAILURE_BACKOFF_MAX_SWEEPS",
            Some(0),
        )?)
        .context("COOLING_FAILURE_BACKOFF_MAX_SWEEPS out of range")?;

        Ok(Self {
            inventory_path,
            http_bind,
            credentials,
            air_label,
            liquid_label,
            poll: PollSettings {
                connect_timeout,
                prompt_timeout,
                prompt_poll_interval,
                prompt_marker,
                command,
            },
            schedule: ScheduleSettings {
                sweep_interval,
                retention,
                max_concurrency,
                failure_backoff_max_sweeps,
            },
        })
    }
}

fn env_string<F>(lookup: &F, key: &str, default: Option<String>) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => Ok(value.trim().to_string()),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64<F>(lookup: &F, key: &str, default: Option<u64>) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        None => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}
