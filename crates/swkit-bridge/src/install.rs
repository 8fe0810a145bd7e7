//! "Add to home screen" install prompt.
//!
//! The platform offers an install handle at most once per offer; the bridge
//! keeps it in a single slot until it is used or the app gets installed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swkit_common::Result;
use tokio::sync::Mutex;
use tracing::{error, info};

/// The user's answer to the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallOutcome {
    Accepted,
    Dismissed,
    /// No install offer was captured.
    Unavailable,
    /// The platform prompt failed.
    Error,
}

/// Resolved value of [`crate::PwaBridge::show_install_prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPromptResult {
    pub outcome: InstallOutcome,
}

impl From<InstallOutcome> for InstallPromptResult {
    fn from(outcome: InstallOutcome) -> Self {
        Self { outcome }
    }
}

/// A deferred install offer from the platform. Consumed by prompting.
#[async_trait]
pub trait InstallPromptHandle: Send {
    /// Show the platform install UI and wait for the user's choice.
    async fn prompt(self: Box<Self>) -> Result<InstallOutcome>;
}

/// Single-use slot for the captured install handle.
#[derive(Default)]
pub struct InstallPromptSlot {
    handle: Option<Box<dyn InstallPromptHandle>>,
}

impl InstallPromptSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fresh offer, replacing any unused one.
    pub fn capture(&mut self, handle: Box<dyn InstallPromptHandle>) {
        self.handle = Some(handle);
    }

    /// Take the handle out; a second call returns `None`.
    pub fn consume(&mut self) -> Option<Box<dyn InstallPromptHandle>> {
        self.handle.take()
    }

    pub fn is_available(&self) -> bool {
        self.handle.is_some()
    }

    pub fn clear(&mut self) {
        self.handle = None;
    }
}

/// Availability callback: `true` when an offer is captured, `false` once the
/// app has been installed.
pub type AvailabilityCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct PromptState {
    slot: InstallPromptSlot,
    callback: Option<AvailabilityCallback>,
}

/// Install-prompt state owned by the bridge.
#[derive(Default)]
pub struct InstallPrompt {
    state: Mutex<PromptState>,
}

impl InstallPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening for install offers.
    pub async fn subscribe(&self, callback: AvailabilityCallback) {
        self.state.lock().await.callback = Some(callback);
    }

    pub async fn is_subscribed(&self) -> bool {
        self.state.lock().await.callback.is_some()
    }

    pub async fn is_available(&self) -> bool {
        self.state.lock().await.slot.is_available()
    }

    /// Platform offered installation. Ignored unless subscribed.
    pub async fn offer(&self, handle: Box<dyn InstallPromptHandle>) {
        let callback = {
            let mut state = self.state.lock().await;
            let Some(callback) = state.callback.clone() else {
                return;
            };
            state.slot.capture(handle);
            callback
        };
        info!("Install prompt is available");
        callback(true);
    }

    /// Platform reports the app was installed.
    pub async fn installed(&self) {
        let callback = {
            let mut state = self.state.lock().await;
            state.slot.clear();
            state.callback.clone()
        };
        info!("App was installed");
        if let Some(callback) = callback {
            callback(false);
        }
    }

    /// Use the captured offer, if any.
    pub async fn show(&self) -> InstallPromptResult {
        let Some(handle) = self.state.lock().await.slot.consume() else {
            info!("Install prompt not available");
            return InstallOutcome::Unavailable.into();
        };

        match handle.prompt().await {
            Ok(outcome) => {
                info!(?outcome, "Install prompt answered");
                outcome.into()
            }
            Err(e) => {
                error!(error = %e, "Install prompt failed");
                InstallOutcome::Error.into()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use swkit_common::SwKitError;

    use super::*;

    /// Scripted install handle counting how often its UI was shown.
    pub struct ScriptedPrompt {
        pub answer: Option<InstallOutcome>,
        pub shown: Arc<AtomicUsize>,
    }

    impl ScriptedPrompt {
        pub fn boxed(
            answer: Option<InstallOutcome>,
            shown: &Arc<AtomicUsize>,
        ) -> Box<dyn InstallPromptHandle> {
            Box::new(Self {
                answer,
                shown: shown.clone(),
            })
        }
    }

    #[async_trait]
    impl InstallPromptHandle for ScriptedPrompt {
        async fn prompt(self: Box<Self>) -> Result<InstallOutcome> {
            self.shown.fetch_add(1, Ordering::SeqCst);
            self.answer
                .ok_or_else(|| SwKitError::internal("prompt() rejected"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::testing::ScriptedPrompt;
    use super::*;

    fn recorder() -> (AvailabilityCallback, Arc<StdMutex<Vec<bool>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |available| sink.lock().unwrap().push(available)), seen)
    }

    #[test]
    fn test_slot_is_single_use() {
        let shown = Arc::new(AtomicUsize::new(0));
        let mut slot = InstallPromptSlot::new();
        assert!(slot.consume().is_none());

        slot.capture(ScriptedPrompt::boxed(Some(InstallOutcome::Accepted), &shown));
        assert!(slot.is_available());
        assert!(slot.consume().is_some());
        assert!(slot.consume().is_none());
    }

    #[tokio::test]
    async fn test_second_show_is_unavailable() {
        let shown = Arc::new(AtomicUsize::new(0));
        let prompt = InstallPrompt::new();
        let (callback, seen) = recorder();
        prompt.subscribe(callback).await;

        prompt
            .offer(ScriptedPrompt::boxed(Some(InstallOutcome::Dismissed), &shown))
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![true]);

        assert_eq!(prompt.show().await.outcome, InstallOutcome::Dismissed);
        assert_eq!(prompt.show().await.outcome, InstallOutcome::Unavailable);
        assert_eq!(shown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offer_ignored_without_subscription() {
        let shown = Arc::new(AtomicUsize::new(0));
        let prompt = InstallPrompt::new();

        prompt
            .offer(ScriptedPrompt::boxed(Some(InstallOutcome::Accepted), &shown))
            .await;
        assert!(!prompt.is_available().await);
        assert_eq!(prompt.show().await.outcome, InstallOutcome::Unavailable);
        assert_eq!(shown.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_installed_discards_offer() {
        let shown = Arc::new(AtomicUsize::new(0));
        let prompt = InstallPrompt::new();
        let (callback, seen) = recorder();
        prompt.subscribe(callback).await;

        prompt
            .offer(ScriptedPrompt::boxed(Some(InstallOutcome::Accepted), &shown))
            .await;
        prompt.installed().await;

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
        assert_eq!(prompt.show().await.outcome, InstallOutcome::Unavailable);
        assert_eq!(shown.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prompt_failure_reports_error() {
        let shown = Arc::new(AtomicUsize::new(0));
        let prompt = InstallPrompt::new();
        let (callback, _) = recorder();
        prompt.subscribe(callback).await;

        prompt.offer(ScriptedPrompt::boxed(None, &shown)).await;
        assert_eq!(prompt.show().await.outcome, InstallOutcome::Error);
    }

    #[test]
    fn test_outcome_serialization() {
        let result = InstallPromptResult::from(InstallOutcome::Unavailable);
        assert_eq!(
            serde_json::to_string(&result).unwrap(),
            r#"{"outcome":"unavailable"}"#
        );
    }
}
