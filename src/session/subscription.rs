//! Pending subscriptions.
//!
//! A [`PendingSubscription`] lives until the caller stops it or the server
//! terminates it. It survives reconnects and is resent, so the caller's
//! `on_ready`/`on_stop` hooks are one-shot while a separate restore flag
//! tracks the reconnect sweep.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;

use crate::error::Error;
use crate::identifiers::SubscriptionId;
use crate::protocol::ClientMessage;

// ============================================================================
// Types
// ============================================================================

/// Hook fired once when the subscription's initial data has arrived.
pub type ReadyHook = Box<dyn FnOnce() + Send>;

/// Hook fired once when the subscription terminates. Carries the server
/// error if the server ended it with one.
pub type StopHook = Box<dyn FnOnce(Option<Error>) + Send>;

// ============================================================================
// SubscribeOptions
// ============================================================================

/// Lifecycle hooks for a subscription.
#[derive(Default)]
pub struct SubscribeOptions {
    pub(crate) on_ready: Option<ReadyHook>,
    pub(crate) on_stop: Option<StopHook>,
}

impl SubscribeOptions {
    /// Creates options with no hooks.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hook fired when the subscription becomes ready.
    #[must_use]
    pub fn on_ready<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_ready = Some(Box::new(hook));
        self
    }

    /// Sets the hook fired when the subscription stops.
    #[must_use]
    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Option<Error>) + Send + 'static,
    {
        self.on_stop = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}

// ============================================================================
// PendingSubscription
// ============================================================================

/// One registered subscription.
pub(crate) struct PendingSubscription {
    name: String,
    params: Vec<Value>,
    on_ready: Option<ReadyHook>,
    on_stop: Option<StopHook>,
    canceled: bool,
    /// Set while the reconnect sweep waits on this subscription.
    restoring: bool,
}

impl PendingSubscription {
    /// Creates a subscription record.
    pub(crate) fn new(name: impl Into<String>, params: Vec<Value>, options: SubscribeOptions) -> Self {
        Self {
            name: name.into(),
            params,
            on_ready: options.on_ready,
            on_stop: options.on_stop,
            canceled: false,
            restoring: false,
        }
    }

    /// Builds the `sub` frame for this subscription.
    pub(crate) fn to_message(&self, id: SubscriptionId) -> ClientMessage {
        ClientMessage::Sub {
            id,
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Arms the restore flag for the reconnect sweep.
    #[inline]
    pub(crate) fn begin_restore(&mut self) {
        self.restoring = true;
    }

    /// Handles a `ready` frame.
    ///
    /// Returns `true` if this settled a pending restore.
    pub(crate) fn mark_ready(&mut self) -> bool {
        if self.canceled {
            return false;
        }
        if let Some(hook) = self.on_ready.take() {
            hook();
        }
        self.take_restore()
    }

    /// Handles a `nosub` frame.
    ///
    /// Returns `true` if this settled a pending restore.
    pub(crate) fn mark_stopped(&mut self, error: Option<Error>) -> bool {
        if self.canceled {
            return false;
        }
        if let Some(hook) = self.on_stop.take() {
            hook(error);
        }
        self.take_restore()
    }

    /// Stops the subscription at the caller's request.
    ///
    /// Returns `true` if a restore was still pending on it.
    pub(crate) fn cancel(&mut self) -> bool {
        self.canceled = true;
        if let Some(hook) = self.on_stop.take() {
            hook(None);
        }
        self.take_restore()
    }

    fn take_restore(&mut self) -> bool {
        std::mem::take(&mut self.restoring)
    }
}

impl fmt::Debug for PendingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSubscription")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("canceled", &self.canceled)
            .field("restoring", &self.restoring)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (SubscribeOptions, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ready = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let (r, s) = (Arc::clone(&ready), Arc::clone(&stopped));
        let options = SubscribeOptions::new()
            .on_ready(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .on_stop(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            });
        (options, ready, stopped)
    }

    #[test]
    fn test_ready_hook_fires_once() {
        let (options, ready, _) = counting();
        let mut sub = PendingSubscription::new("todos", vec![], options);

        sub.mark_ready();
        sub.mark_ready();
        assert_eq!(ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restore_flag_is_one_shot() {
        let (options, ready, _) = counting();
        let mut sub = PendingSubscription::new("todos", vec![], options);

        sub.mark_ready();
        sub.begin_restore();
        assert!(sub.mark_ready());
        assert!(!sub.mark_ready());
        assert_eq!(ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nosub_passes_error() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&seen);
        let options = SubscribeOptions::new().on_stop(move |err| {
            *sink.lock() = err.map(|e| e.to_string());
        });
        let mut sub = PendingSubscription::new("secret", vec![], options);

        sub.mark_stopped(Some(Error::server("403", Some("denied".into()), None)));
        assert_eq!(seen.lock().as_deref(), Some("Server error [403]: denied"));
    }

    #[test]
    fn test_cancel_fires_stop_and_silences_later_frames() {
        let (options, ready, stopped) = counting();
        let mut sub = PendingSubscription::new("todos", vec![], options);

        sub.begin_restore();
        assert!(sub.cancel());
        assert!(!sub.mark_ready());
        assert!(!sub.mark_stopped(None));
        assert_eq!(ready.load(Ordering::SeqCst), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_to_message() {
        let sub = PendingSubscription::new("todos", vec![Value::from("list-1")], SubscribeOptions::new());
        let id: SubscriptionId = "5".parse().expect("id");
        assert_eq!(
            sub.to_message(id),
            ClientMessage::Sub {
                id,
                name: "todos".into(),
                params: vec![Value::from("list-1")],
            }
        );
    }
}
