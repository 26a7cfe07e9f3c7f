//! Runtime Configuration
//!
//! Host applications usually keep these settings next to the rest of their
//! configuration and load them as JSON. Every field has a default, so an
//! empty object is a valid configuration.
//!
//! ```json
//! { "flush_mode": "deferred", "max_flush_passes": 32 }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};

/// When pending dirty work gets flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// The host calls [`Runtime::flush`](crate::reactive::Runtime::flush)
    /// or [`Runtime::run_until_idle`](crate::reactive::Runtime::run_until_idle).
    #[default]
    Manual,

    /// Flush as soon as the outermost public operation (a write, a batch,
    /// an effect creation) returns.
    Immediate,

    /// Post one flush per tick to the runtime's
    /// [`Executor`](crate::executor::Executor).
    Deferred,
}

/// Settings for a [`Runtime`](crate::reactive::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flush scheduling strategy.
    pub flush_mode: FlushMode,

    /// Upper bound on chained flush passes before giving up with
    /// [`ReactiveError::FlushLimit`]. Effects that keep writing signals
    /// they depend on hit this limit.
    pub max_flush_passes: usize,

    /// Upper bound on nested computed/effect evaluations.
    ///
    /// Reading a computed that has never been evaluated evaluates its whole
    /// unevaluated upstream chain recursively, one nesting level per link.
    /// A cold chain longer than this limit fails with
    /// [`ReactiveError::DepthExceeded`] and the links that failed keep the
    /// failure. Evaluate long chains a link at a time, from the source
    /// end, or raise the limit. Flushes resolve in level order and seldom
    /// nest.
    pub max_tracking_depth: usize,

    /// Catch panics from compute functions, effect bodies and equality
    /// functions and report them as errors. When disabled, panics unwind
    /// straight through the runtime.
    pub catch_panics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Manual,
            max_flush_passes: 100,
            max_tracking_depth: 256,
            catch_panics: true,
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ReactiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Use the given flush mode.
    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    /// Check the numeric limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_flush_passes == 0 {
            return Err(ReactiveError::Config(
                "max_flush_passes must be at least 1".into(),
            ));
        }
        if self.max_tracking_depth == 0 {
            return Err(ReactiveError::Config(
                "max_tracking_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
