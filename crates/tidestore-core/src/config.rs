//! Configuration management for Tidestore
//!
//! Provides presets for the runtime checks a store performs and a
//! validation step run by `StoreBuilder::build`.

/// Store configuration with runtime-check presets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Store name used in logs and errors; generated from the call site when `None`
    pub name: Option<String>,
    /// Report commits issued from inside a subscriber callback of the same store
    pub detect_recursive_commit: bool,
    /// Report deliveries that had to be recovered from a version inversion
    pub report_order_recovery: bool,
    /// Emit a `tracing` debug event for every commit
    pub trace_commits: bool,
    /// Thread name for the store's dedicated background executor
    pub background_thread_name: String,
}

impl StoreConfig {
    /// Development: every check on, every commit traced
    pub fn development() -> Self {
        Self {
            name: None,
            detect_recursive_commit: true,
            report_order_recovery: true,
            trace_commits: true,
            background_thread_name: "tidestore-background".to_string(),
        }
    }

    /// Production: ordering recoveries still reported, per-commit overhead off
    pub fn production() -> Self {
        Self {
            name: None,
            detect_recursive_commit: false,
            report_order_recovery: true,
            trace_commits: false,
            background_thread_name: "tidestore-background".to_string(),
        }
    }

    /// Silent: nothing reported, used for internal derived stores
    pub fn silent() -> Self {
        Self {
            name: None,
            detect_recursive_commit: false,
            report_order_recovery: false,
            trace_commits: false,
            background_thread_name: "tidestore-background".to_string(),
        }
    }

    /// Set the store name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err("name must not be empty".into());
            }
        }
        if self.background_thread_name.is_empty() {
            return Err("background_thread_name must not be empty".into());
        }
        if self.background_thread_name.contains('\0') {
            return Err("background_thread_name must not contain NUL".into());
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self { Self::development() }
}
