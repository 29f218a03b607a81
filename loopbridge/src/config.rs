//! Bridge configuration.
//!
//! Usually built in code; binaries may load it from a TOML file:
//!
//! ```toml
//! idle_ceiling_ms = 100
//! quit_on_last_window_closed = false
//! host_worker_threads = 2
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Longest the idle driver sleeps between pumps, whatever the runtime reports.
pub const DEFAULT_IDLE_CEILING_MS: u64 = 100;

/// Worker threads of the host runtime built by [`run_app`](crate::run_app).
pub const DEFAULT_HOST_WORKER_THREADS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Idle driver sleep ceiling, in milliseconds.
    pub idle_ceiling_ms: u64,
    /// Forwarded to the foreign `run_event_loop` call.
    pub quit_on_last_window_closed: bool,
    /// Worker threads of the host tokio runtime.
    pub host_worker_threads: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            idle_ceiling_ms: DEFAULT_IDLE_CEILING_MS,
            quit_on_last_window_closed: false,
            host_worker_threads: DEFAULT_HOST_WORKER_THREADS,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(source: &str) -> Result<Self, BridgeError> {
        let config: Self =
            toml::from_str(source).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("can't read {}: {e}", path.display())))?;
        Self::from_toml(&source)
    }

    pub fn idle_ceiling(&self) -> Duration {
        Duration::from_millis(self.idle_ceiling_ms)
    }

    /// Reject values the bridge can't run with.
    pub(crate) fn validate(&self) -> Result<(), BridgeError> {
        if self.idle_ceiling_ms == 0 {
            return Err(BridgeError::Config("idle_ceiling_ms must be positive".into()));
        }
        if self.host_worker_threads == 0 {
            return Err(BridgeError::Config(
                "host_worker_threads must be positive".into(),
            ));
        }
        Ok(())
    }
}
