//! Process configuration.
//!
//! The configuration is read once at startup from a RON file and passed
//! by reference into the controller; nothing here is globally mutable.

use std::path::{Path, PathBuf};

use herald_delivery::{QueueConfig, SmtpConfig};
use herald_store::StoreConfig;
use serde::Deserialize;

/// Root configuration, deserialized from `herald.config.ron`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeraldConfig {
    /// Recipient store backing storage.
    #[serde(default)]
    pub store: StoreConfig,

    /// Worker retry and pacing settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// SMTP smarthost to submit through.
    pub smtp: SmtpConfig,

    /// Campaign message metadata.
    pub message: MessageConfig,
}

/// Campaign message metadata; the HTML body is read from `html_path` at
/// startup.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageConfig {
    /// Sender, either a bare address or `"Display Name" <address>`.
    pub from: String,
    pub subject: String,
    /// Path to the file holding the HTML body.
    pub html_path: PathBuf,
}

/// Default configuration written by `herald config` when none exists.
pub const DEFAULT_CONFIG: &str = r#"(
    store: File(
        path: "herald.db",
    ),
    queue: (
        max_tries: 2,
        retry_delay_secs: 4,
        inter_task_delay_secs: 0,
    ),
    smtp: (
        host: "smtp.example.org",
        port: 587,
        username: Some("username"),
        password: Some("password"),
        require_tls: false,
        timeout_secs: 30,
        hello_name: "localhost",
    ),
    message: (
        from: "\"Example\" <campaign@example.org>",
        subject: "Hello",
        html_path: "message.html",
    ),
)
"#;

impl HeraldConfig {
    /// Parse a configuration from RON text.
    ///
    /// # Errors
    /// If the text is not a valid configuration
    pub fn from_ron(content: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(content)
    }

    /// Load the configuration from `path`.
    ///
    /// # Errors
    /// If the file cannot be read or parsed
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;

        Ok(Self::from_ron(&content)?)
    }
}

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("HERALD_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "HERALD_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = vec![
        PathBuf::from("./herald.config.ron"),
        PathBuf::from("/etc/herald/herald.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - HERALD_CONFIG environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config = HeraldConfig::from_ron(DEFAULT_CONFIG).expect("Default config must parse");
        assert_eq!(config.smtp.host, "smtp.example.org");
        assert_eq!(config.smtp.port, 587);
        assert_eq!(config.queue.max_tries, 2);
        assert_eq!(config.message.subject, "Hello");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = HeraldConfig::from_ron(
            r#"(
                smtp: (host: "mail.example.org"),
                message: (
                    from: "a@example.org",
                    subject: "Hi",
                    html_path: "body.html",
                ),
            )"#,
        )
        .expect("Minimal config must parse");

        assert_eq!(config.queue.max_tries, 2);
        assert_eq!(config.smtp.port, 587);
        assert!(matches!(config.store, StoreConfig::File { .. }));
    }

    #[test]
    fn test_memory_store_config() {
        let config = HeraldConfig::from_ron(
            r#"(
                store: Memory,
                smtp: (host: "mail.example.org"),
                message: (from: "a@b.c", subject: "s", html_path: "h.html"),
            )"#,
        )
        .expect("Config must parse");

        assert!(matches!(config.store, StoreConfig::Memory));
    }
}
