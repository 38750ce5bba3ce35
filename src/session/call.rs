//! Pending remote method calls.
//!
//! A [`PendingCall`] tracks one in-flight call from the moment it is issued
//! until its completion callback fires. Completion requires two independent
//! facts: the `result` frame arrived, and the server reported the call's
//! writes as visible (`updated`). Cancellation preempts both.
//!
//! The callback is stored as an `Option` and taken on first use, so it runs
//! at most once no matter how the state transitions interleave.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::identifiers::CallId;
use crate::protocol::ClientMessage;

// ============================================================================
// Types
// ============================================================================

/// Completion callback of a call. Receives the method's return value or
/// the error that ended it.
pub type CallCallback = Box<dyn FnOnce(Result<Value>) + Send>;

/// Hook invoked as soon as the `result` frame arrives, before the call's
/// writes are necessarily visible.
pub type ResultHook = Box<dyn FnOnce(&Result<Value>) + Send>;

// ============================================================================
// CallOptions
// ============================================================================

/// Dispatch options for a remote method call.
///
/// # Example
///
/// ```ignore
/// let options = CallOptions::new().wait().no_retry();
/// ```
#[derive(Default)]
pub struct CallOptions {
    /// Block every later queued call until this one completes.
    pub wait: bool,
    /// Cancel instead of resending if the connection drops while in flight.
    pub no_retry: bool,
    /// Drop if the connection drops while still queued.
    pub cancel_on_reconnect: bool,
    /// Send immediately when connected, ahead of the queue.
    pub skip_queue: bool,
    /// Hook fired when the result arrives.
    pub(crate) on_result_received: Option<ResultHook>,
}

impl CallOptions {
    /// Creates default options: queued, retried across reconnects.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the call as a barrier for the calls queued after it.
    #[inline]
    #[must_use]
    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    /// Cancels the call if the connection drops while it is in flight.
    #[inline]
    #[must_use]
    pub fn no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }

    /// Drops the call if the connection drops while it is still queued.
    #[inline]
    #[must_use]
    pub fn cancel_on_reconnect(mut self) -> Self {
        self.cancel_on_reconnect = true;
        self
    }

    /// Sends the call ahead of everything queued.
    #[inline]
    #[must_use]
    pub fn skip_queue(mut self) -> Self {
        self.skip_queue = true;
        self
    }

    /// Sets a hook fired when the result frame arrives.
    #[must_use]
    pub fn on_result_received<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Result<Value>) + Send + 'static,
    {
        self.on_result_received = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("wait", &self.wait)
            .field("no_retry", &self.no_retry)
            .field("cancel_on_reconnect", &self.cancel_on_reconnect)
            .field("skip_queue", &self.skip_queue)
            .field("on_result_received", &self.on_result_received.is_some())
            .finish()
    }
}

// ============================================================================
// PendingCall
// ============================================================================

/// One remote method call awaiting completion.
pub(crate) struct PendingCall {
    /// Method name.
    name: String,
    /// Positional arguments, resent verbatim on reconnect.
    params: Vec<Value>,
    /// Cancel rather than resend after a connection loss.
    no_retry: bool,
    /// Completion callback; `None` once fired.
    callback: Option<CallCallback>,
    /// Result hook; `None` once fired.
    on_result_received: Option<ResultHook>,
    /// Recorded outcome, held until data is visible.
    outcome: Option<Result<Value>>,
    /// Whether a `result` frame has been recorded.
    result_received: bool,
    /// Whether an `updated` frame has been recorded.
    data_visible: bool,
    /// Whether the call was canceled.
    canceled: bool,
}

impl PendingCall {
    /// Creates a pending call.
    pub(crate) fn new(
        name: impl Into<String>,
        params: Vec<Value>,
        no_retry: bool,
        on_result_received: Option<ResultHook>,
        callback: CallCallback,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            no_retry,
            callback: Some(callback),
            on_result_received,
            outcome: None,
            result_received: false,
            data_visible: false,
            canceled: false,
        }
    }

    /// Builds the `method` frame for this call.
    pub(crate) fn to_message(&self, id: CallId) -> ClientMessage {
        ClientMessage::Method {
            id,
            method: self.name.clone(),
            params: self.params.clone(),
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn no_retry(&self) -> bool {
        self.no_retry
    }

    #[inline]
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled
    }

    #[inline]
    pub(crate) fn has_result(&self) -> bool {
        self.result_received
    }

    #[inline]
    pub(crate) fn is_data_visible(&self) -> bool {
        self.data_visible
    }

    /// Returns `true` once the completion callback has run.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.callback.is_none()
    }

    /// Records the outcome carried by a `result` frame.
    ///
    /// A second result is a server protocol violation; it is logged and
    /// ignored. Returns `true` if this completed the call.
    pub(crate) fn record_result(&mut self, outcome: Result<Value>) -> bool {
        if self.canceled {
            return false;
        }
        if self.result_received {
            warn!(method = %self.name, "Method received result more than once");
            return false;
        }

        self.result_received = true;
        if let Some(hook) = self.on_result_received.take() {
            hook(&outcome);
        }
        self.outcome = Some(outcome);
        self.try_complete()
    }

    /// Records that the call's writes are visible in the data stream.
    ///
    /// Returns `true` if this completed the call.
    pub(crate) fn mark_data_visible(&mut self) -> bool {
        if self.canceled {
            return false;
        }
        if self.data_visible {
            warn!(method = %self.name, "Method received \"updated\" more than once");
            return false;
        }

        self.data_visible = true;
        self.try_complete()
    }

    /// Cancels the call, firing the callback with `error` (or a generic
    /// cancellation) unless it already ran.
    ///
    /// Returns `true` if this invocation fired the callback.
    pub(crate) fn cancel(&mut self, error: Option<Error>) -> bool {
        self.canceled = true;
        match self.callback.take() {
            Some(callback) => {
                callback(Err(error.unwrap_or_else(Error::canceled)));
                true
            }
            None => false,
        }
    }

    /// Fires the callback once both facts are recorded.
    fn try_complete(&mut self) -> bool {
        if !(self.result_received && self.data_visible) {
            return false;
        }
        let Some(callback) = self.callback.take() else {
            return false;
        };
        let outcome = self.outcome.take().unwrap_or(Ok(Value::Null));
        callback(outcome);
        true
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("name", &self.name)
            .field("no_retry", &self.no_retry)
            .field("result_received", &self.result_received)
            .field("data_visible", &self.data_visible)
            .field("canceled", &self.canceled)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
