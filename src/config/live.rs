//! Runtime-mutable view of the farm settings.

use std::sync::{Arc, PoisonError, RwLock};

use super::FarmSettings;

/// Shared handle to the current [`FarmSettings`].
///
/// Components never cache settings across iterations; they take a
/// [`snapshot`](Self::snapshot) each time they make a decision, so an
/// operator can change limits or toggle maintenance while tests are running.
///
/// # Example
///
/// ```
/// use testfarm::config::{FarmSettings, LiveConfig};
///
/// let live = LiveConfig::new(FarmSettings::default());
/// live.set_maintenance(true);
/// assert!(live.snapshot().maintenance_mode);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    inner: Arc<RwLock<FarmSettings>>,
}

impl LiveConfig {
    pub fn new(settings: FarmSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Returns a copy of the current settings.
    pub fn snapshot(&self) -> FarmSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `f` to the settings in place.
    pub fn update(&self, f: impl FnOnce(&mut FarmSettings)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Replaces the settings wholesale (e.g. after reloading the file).
    pub fn replace(&self, settings: FarmSettings) {
        self.update(|s| *s = settings);
    }

    pub fn set_maintenance(&self, on: bool) {
        self.update(|s| s.maintenance_mode = on);
    }
}
