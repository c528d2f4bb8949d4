//! Bridge configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How `execute` behaves for a notebook that has no session yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// A session must be initialized before any cell can run.
    #[default]
    Explicit,
    /// The first `execute` starts a session with the default kernel.
    Lazy,
}

impl std::str::FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit" => Ok(SessionMode::Explicit),
            "lazy" => Ok(SessionMode::Lazy),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

/// Configuration shared by every session the bridge creates.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bound on launch plus `kernel_info` handshake.
    pub startup_timeout: Duration,
    /// Bound on a single iopub poll while a drain is in progress.
    pub poll_timeout: Duration,
    /// Time a kernel gets to exit after `shutdown_request` before it is killed.
    pub shutdown_grace: Duration,
    /// Lazy or explicit session creation.
    pub session_mode: SessionMode,
    /// Kernelspec used when a session is created lazily.
    pub default_kernel: String,
    /// Where connection files are written.
    pub connection_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            session_mode: SessionMode::Explicit,
            default_kernel: "python3".to_string(),
            connection_dir: runtimelib::dirs::runtime_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.session_mode, SessionMode::Explicit);
        assert_eq!(config.default_kernel, "python3");
    }

    #[test]
    fn test_session_mode_from_str() {
        assert_eq!("lazy".parse::<SessionMode>(), Ok(SessionMode::Lazy));
        assert_eq!("explicit".parse::<SessionMode>(), Ok(SessionMode::Explicit));
        assert!("eager".parse::<SessionMode>().is_err());
    }

    #[test]
    fn test_session_mode_serialize() {
        let json = serde_json::to_string(&SessionMode::Lazy).unwrap();
        assert_eq!(json, "\"lazy\"");
    }
}
