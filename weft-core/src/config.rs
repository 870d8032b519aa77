//! Context configuration.
//!
//! [`EngineConfig`] holds the plain, serializable policy knobs; it can be
//! loaded from JSON alongside the rest of an application's settings.
//! [`ContextOptions`] adds the runtime-only pieces (hooks) and is what
//! [`Context::with_options`](crate::Context::with_options) consumes.

use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reactive::{PendingNotifications, ScheduledEffect};

/// Default bound for effect-triggered re-entries into one node.
pub const DEFAULT_MAX_EFFECT_REENTRIES: usize = 8;

/// Serializable engine policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many times one node may reappear in a single cause chain before
    /// the update is treated as a runaway loop.
    pub max_effect_reentries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_effect_reentries: DEFAULT_MAX_EFFECT_REENTRIES,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Hook receiving scheduled effects instead of the built-in queue.
pub type EffectHook = Rc<dyn Fn(ScheduledEffect)>;

/// Hook receiving listener notifications instead of calling them at commit.
pub type NotificationHook = Rc<dyn Fn(PendingNotifications)>;

/// Options for creating a [`Context`](crate::Context).
#[derive(Clone, Default)]
pub struct ContextOptions {
    /// Engine policy.
    pub config: EngineConfig,

    /// When set, every effect scheduled by user code is handed to this hook
    /// after commit. The hook decides when to call [`ScheduledEffect::run`].
    pub on_effect_scheduled: Option<EffectHook>,

    /// When set, listener notifications are not delivered at commit.
    /// They accumulate, keeping only the latest state per listener, and the
    /// hook receives one [`PendingNotifications`] batch to deliver them
    /// later. Commits before delivery join the same batch.
    pub on_notifications_scheduled: Option<NotificationHook>,
}

impl ContextOptions {
    /// Options with default configuration and the built-in effect queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the re-entry bound used for runaway detection.
    pub fn max_effect_reentries(mut self, limit: usize) -> Self {
        self.config.max_effect_reentries = limit;
        self
    }

    /// Route scheduled effects through `hook`.
    pub fn on_effect_scheduled<F>(mut self, hook: F) -> Self
    where
        F: Fn(ScheduledEffect) + 'static,
    {
        self.on_effect_scheduled = Some(Rc::new(hook));
        self
    }

    /// Defer listener notifications to `hook`.
    pub fn on_notifications_scheduled<F>(mut self, hook: F) -> Self
    where
        F: Fn(PendingNotifications) + 'static,
    {
        self.on_notifications_scheduled = Some(Rc::new(hook));
        self
    }
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("config", &self.config)
            .field("on_effect_scheduled", &self.on_effect_scheduled.is_some())
            .field(
                "on_notifications_scheduled",
                &self.on_notifications_scheduled.is_some(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_use_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_effect_reentries, DEFAULT_MAX_EFFECT_REENTRIES);
    }

    #[test]
    fn parses_reentry_bound() {
        let config = EngineConfig::from_json(r#"{"max_effect_reentries": 3}"#).unwrap();
        assert_eq!(config.max_effect_reentries, 3);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = EngineConfig::from_json("{max:").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builder_overrides_bound() {
        let options = ContextOptions::new().max_effect_reentries(2);
        assert_eq!(options.config.max_effect_reentries, 2);
        assert!(options.on_effect_scheduled.is_none());
    }
}
