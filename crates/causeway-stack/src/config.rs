//! Construction-time configuration for the cause stack manager.

use serde::{Deserialize, Serialize};

/// Environment variable that turns on verbose frame diagnostics.
pub const DEBUG_FRAMES_ENV: &str = "CAUSEWAY_DEBUG_CAUSE_FRAMES";

/// Default name of the thread allowed to use the manager during shutdown.
pub const DEFAULT_SHUTDOWN_THREAD: &str = "causeway-shutdown";

/// Configuration read once when a
/// [`CauseStackManager`](crate::manager::CauseStackManager) is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CauseStackConfig {
    /// Capture the call site of every frame (and provider registration) so
    /// corruption reports can say where leaked frames were opened.
    #[serde(default)]
    pub verbose_frames: bool,
    /// Name of the one extra thread permitted besides the owner. `None`
    /// confines the manager strictly to its owning thread.
    #[serde(default = "default_shutdown_thread")]
    pub shutdown_thread_name: Option<String>,
}

fn default_shutdown_thread() -> Option<String> {
    Some(DEFAULT_SHUTDOWN_THREAD.to_owned())
}

impl Default for CauseStackConfig {
    /// Verbose diagnostics off, default shutdown thread name.
    fn default() -> Self {
        Self {
            verbose_frames: false,
            shutdown_thread_name: default_shutdown_thread(),
        }
    }
}

impl CauseStackConfig {
    /// Defaults, with `verbose_frames` taken from
    /// [`CAUSEWAY_DEBUG_CAUSE_FRAMES`](DEBUG_FRAMES_ENV).
    pub fn from_env() -> Self {
        let verbose_frames = std::env::var(DEBUG_FRAMES_ENV)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        Self {
            verbose_frames,
            ..Self::default()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
