//! Bridge configuration

use std::env;
use std::path::PathBuf;

/// Per-account configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bare JID of the local account
    pub account_jid: String,

    /// Optional human label published with our device id
    pub device_label: Option<String>,

    /// Snapshot directory override; defaults to the per-user config dir
    pub data_dir: Option<PathBuf>,

    /// When true, failed encryption falls back to the warning stanza.
    /// Plaintext is never sent either way.
    pub omemo_required: bool,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl BridgeConfig {
    /// Minimal configuration for an account
    pub fn new(account_jid: impl Into<String>) -> Self {
        Self {
            account_jid: account_jid.into(),
            device_label: None,
            data_dir: None,
            omemo_required: true,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    ///
    /// - `ACCOUNT_JID` (required in production; defaults with a warning)
    /// - `DEVICE_LABEL` (optional)
    /// - `DATA_DIR` (optional)
    /// - `OMEMO_REQUIRED` or `true`
    /// - `LOG_LEVEL` or `info`
    pub fn from_env() -> Self {
        let account_jid = env::var("ACCOUNT_JID").unwrap_or_else(|_| {
            eprintln!("WARNING: ACCOUNT_JID not set, using agent@localhost");
            "agent@localhost".to_string()
        });

        Self {
            account_jid,
            device_label: env::var("DEVICE_LABEL").ok(),
            data_dir: env::var("DATA_DIR").ok().map(PathBuf::from),
            omemo_required: env::var("OMEMO_REQUIRED")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(true),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new("bot@example.org");
        assert_eq!(config.account_jid, "bot@example.org");
        assert!(config.omemo_required);
        assert!(config.data_dir.is_none());
    }
}
