//! The delivery transport seam.
//!
//! One call sends one message to one recipient; retries live in the
//! worker, never here.

pub mod smtp;

use std::{
    collections::HashMap,
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::TransportError;

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender, either a bare address or `"Display Name" <address>`.
    pub from: String,
    /// Recipient address.
    pub to: String,
    pub subject: String,
    /// HTML body.
    pub html: String,
}

impl Message {
    /// The bare sender address for the envelope, stripped of any display
    /// name.
    #[must_use]
    pub fn envelope_from(&self) -> &str {
        envelope_address(&self.from)
    }

    /// Render the message as an RFC 5322 document with an HTML body.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{}",
            self.from, self.to, self.subject, self.html
        )
    }
}

/// Extract the address between `<` and `>`, or the whole string if there
/// are no angle brackets.
fn envelope_address(value: &str) -> &str {
    match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.trim(),
    }
}

/// Sends one message to one recipient.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Attempt delivery of `message`. A returned error describes one
    /// failed attempt; whether it is re-attempted is the caller's call.
    async fn send(&self, message: &Message) -> Result<(), TransportError>;
}

/// Mock implementation of Transport for testing
///
/// Outcomes can be scripted per recipient; unscripted sends succeed.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Message>>,
    scripts: Mutex<HashMap<String, VecDeque<Result<(), TransportError>>>>,
    notify: Arc<Notify>,
}

impl MockTransport {
    /// Create a new mock transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next send to `to` fail with a scripted connection error.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned
    pub fn fail_next(&self, to: &str) {
        self.script(
            to,
            Err(TransportError::Connect("scripted failure".to_string())),
        );
    }

    /// Make the next send to `to` succeed (useful after queued failures).
    ///
    /// # Panics
    /// Panics if the mutex is poisoned
    pub fn succeed_next(&self, to: &str) {
        self.script(to, Ok(()));
    }

    /// Queue an explicit outcome for the next send to `to`.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned
    pub fn script(&self, to: &str, outcome: Result<(), TransportError>) {
        self.scripts
            .lock()
            .expect("MockTransport scripts mutex poisoned")
            .entry(to.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// All successfully sent messages, in send order.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent
            .lock()
            .expect("MockTransport sent mutex poisoned")
            .clone()
    }

    /// Number of successfully sent messages.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .expect("MockTransport sent mutex poisoned")
            .len()
    }

    /// Wait until the next send attempt finishes, success or not.
    pub async fn wait_for_send(&self) {
        self.notify.notified().await;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let outcome = self
            .scripts
            .lock()
            .expect("MockTransport scripts mutex poisoned")
            .get_mut(&message.to)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));

        if outcome.is_ok() {
            self.sent
                .lock()
                .expect("MockTransport sent mutex poisoned")
                .push(message.clone());
        }

        self.notify.notify_waiters();
        outcome
    }
}
