// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Supervisor and remote-access gateway for AI coding agents.
#[derive(Debug, Clone, Parser)]
#[command(name = "porter", version, about)]
pub struct Config {
    /// HTTP port to listen on.
    #[arg(long, env = "PORTER_PORT", default_value = "7433")]
    pub port: u16,

    /// Host address to bind to.
    #[arg(long, env = "PORTER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Data directory for session logs, auth, and resume state.
    #[arg(long, env = "PORTER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Profile name, used as the SRP identity for remote access.
    #[arg(long, env = "PORTER_PROFILE", default_value = "default")]
    pub profile_name: String,

    /// Require local password auth for direct connections.
    #[arg(long, env = "PORTER_AUTH_ENABLED")]
    pub auth_enabled: bool,

    /// Operator recovery: bypass local auth even when an account exists.
    #[arg(long, env = "PORTER_AUTH_DISABLED")]
    pub auth_disabled: bool,

    /// Token granting a desktop shell cookie-equivalent trust.
    #[arg(long, env = "PORTER_DESKTOP_AUTH_TOKEN")]
    pub desktop_auth_token: Option<String>,

    /// Comma-separated SSH host aliases allowed as remote executors.
    #[arg(long, env = "PORTER_REMOTE_EXECUTORS")]
    pub remote_executors: Option<String>,

    /// Host-header allowlist: "*", a comma list, or empty to disable.
    #[arg(long, env = "PORTER_ALLOWED_HOSTS", default_value = "")]
    pub allowed_hosts: String,

    /// Persist relay resume sessions to disk instead of memory only.
    #[arg(long, env = "PORTER_PERSIST_REMOTE_SESSIONS")]
    pub persist_remote_sessions: bool,

    /// Deadline in milliseconds for blocking sends waiting on idle.
    #[arg(long, env = "PORTER_IDLE_TIMEOUT_MS", default_value = "120000")]
    pub idle_timeout_ms: u64,

    /// Per-process cap on pending queued messages.
    #[arg(long, env = "PORTER_MESSAGE_QUEUE_CAP", default_value = "32")]
    pub message_queue_cap: usize,

    /// Max concurrently running processes per project.
    #[arg(long, env = "PORTER_PER_PROJECT_CAP", default_value = "3")]
    pub per_project_cap: usize,

    /// Max queued start requests per project (admission queue).
    #[arg(long, env = "PORTER_MAX_QUEUE_SIZE", default_value = "16")]
    pub max_queue_size: usize,

    /// Global cap on running processes (0 = unlimited).
    #[arg(long, env = "PORTER_GLOBAL_CAP", default_value = "0")]
    pub global_cap: usize,

    /// Project index cache TTL in milliseconds.
    #[arg(long, env = "PORTER_CACHE_TTL_MS", default_value = "5000")]
    pub cache_ttl_ms: u64,

    /// Grace period in milliseconds before abort escalates to SIGKILL.
    #[arg(long, env = "PORTER_ABORT_GRACE_MS", default_value = "2000")]
    pub abort_grace_ms: u64,

    /// Override the agent executable (testing and harnesses).
    #[arg(long, env = "PORTER_AGENT_CMD")]
    pub agent_cmd: Option<String>,

    /// Default provider for new sessions (claude, codex).
    #[arg(long, env = "PORTER_PROVIDER", default_value = "claude")]
    pub provider: String,

    /// Log format (json or text).
    #[arg(long, env = "PORTER_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PORTER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.message_queue_cap == 0 {
            anyhow::bail!("--message-queue-cap must be at least 1");
        }
        if self.per_project_cap == 0 {
            anyhow::bail!("--per-project-cap must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "json" | "text") {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }
        for alias in self.remote_executor_list() {
            validate_ssh_alias(&alias)?;
        }
        Ok(())
    }

    /// Resolve the data directory, defaulting to `~/.porter`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.data_dir {
            return dir.clone();
        }
        home_dir().join(".porter")
    }

    /// Root directory containing per-project session log trees.
    pub fn sessions_root(&self) -> PathBuf {
        self.resolved_data_dir().join("projects")
    }

    /// Parsed remote executor aliases (empty when unset).
    pub fn remote_executor_list(&self) -> Vec<String> {
        self.remote_executors
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    /// Parsed Host-header allowlist. `None` disables the check.
    pub fn allowed_host_list(&self) -> Option<Vec<String>> {
        let trimmed = self.allowed_hosts.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed == "*" {
            return Some(vec!["*".to_owned()]);
        }
        Some(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect(),
        )
    }
}

/// Validate an SSH host alias: alphanumerics, dots, dashes, underscores.
fn validate_ssh_alias(alias: &str) -> anyhow::Result<()> {
    if alias.is_empty()
        || !alias.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '@'))
    {
        anyhow::bail!("invalid remote executor alias: {alias}");
    }
    Ok(())
}

/// Home directory from the environment, falling back to the filesystem root.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
