//! In-memory transport for tests.
//!
//! `open` immediately reports [`TransportEvent::Open`] and `close` reports
//! [`TransportEvent::Close`], as a socket to a reachable server would. Tests
//! play the server through [`MockServer`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent, TransportEvents};

#[derive(Default)]
struct State {
    events: Option<TransportEvents>,
    open: bool,
    opens: usize,
    closes: usize,
}

/// Transport half handed to the session.
pub(crate) struct MockTransport {
    state: Arc<Mutex<State>>,
    sent_tx: mpsc::UnboundedSender<Value>,
}

/// Server half kept by the test.
pub(crate) struct MockServer {
    state: Arc<Mutex<State>>,
    sent_rx: mpsc::UnboundedReceiver<Value>,
}

pub(crate) fn pair() -> (MockTransport, MockServer) {
    let state = Arc::new(Mutex::new(State::default()));
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            state: Arc::clone(&state),
            sent_tx,
        },
        MockServer { state, sent_rx },
    )
}

impl Transport for MockTransport {
    fn open(&mut self, events: TransportEvents) {
        let mut state = self.state.lock();
        if state.open {
            return;
        }
        state.open = true;
        state.opens += 1;
        let _ = events.send(TransportEvent::Open);
        state.events = Some(events);
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        state.closes += 1;
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Close);
        }
    }

    fn send(&mut self, text: String) {
        if !self.state.lock().open {
            return;
        }
        let value = serde_json::from_str(&text).expect("client frames are JSON");
        let _ = self.sent_tx.send(value);
    }
}

impl MockServer {
    /// Sends a frame to the client.
    pub(crate) fn push(&self, frame: Value) {
        let state = self.state.lock();
        let events = state.events.as_ref().expect("transport was opened");
        let _ = events.send(TransportEvent::Message(frame.to_string()));
    }

    /// Simulates the connection dropping.
    pub(crate) fn drop_connection(&self) {
        let mut state = self.state.lock();
        if !state.open {
            return;
        }
        state.open = false;
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Close);
        }
    }

    /// Awaits the next frame the client sent.
    pub(crate) async fn next_sent(&mut self) -> Value {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.sent_rx.recv())
            .await
            .expect("client sent a frame in time")
            .expect("transport alive")
    }

    /// Awaits the next frame with the given `msg`, skipping others.
    pub(crate) async fn next_sent_of(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next_sent().await;
            if frame["msg"] == kind {
                return frame;
            }
        }
    }

    /// Returns every frame sent so far without waiting.
    pub(crate) fn drain_sent(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().closes
    }
}
