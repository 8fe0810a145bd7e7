//! What the hosting platform reports about itself.

use serde::{Deserialize, Serialize};

/// Signals used to tell whether the app runs installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayEnvironment {
    /// `(display-mode: standalone)` matches.
    pub display_mode_standalone: bool,
    /// iOS `navigator.standalone`.
    pub navigator_standalone: bool,
    /// Document referrer.
    pub referrer: String,
}

impl DisplayEnvironment {
    /// A regular browser tab.
    pub fn browser() -> Self {
        Self::default()
    }

    /// An installed app window.
    pub fn standalone() -> Self {
        Self {
            display_mode_standalone: true,
            ..Self::default()
        }
    }

    /// Any one signal is enough.
    pub fn is_standalone(&self) -> bool {
        self.display_mode_standalone
            || self.navigator_standalone
            || self.referrer.contains("android-app://")
    }
}

/// Platform feature support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub service_worker: bool,
    pub push: bool,
    pub cache_storage: bool,
    pub storage_estimate: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            service_worker: true,
            push: true,
            cache_storage: true,
            storage_estimate: true,
        }
    }
}

impl Capabilities {
    /// No service worker, push or storage support.
    pub fn none() -> Self {
        Self {
            service_worker: false,
            push: false,
            cache_storage: false,
            storage_estimate: false,
        }
    }

    /// Worker and push both available.
    pub fn is_pwa_supported(&self) -> bool {
        self.service_worker && self.push
    }
}
