//! `MainThreadMessageService`: user-facing messages from the guest.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::rpc::{unknown_method, Args, LocalService, RpcValue, ServiceFuture, ServiceResult};
use crate::services::methods::message as m;
use crate::services::MainService;

const RECENT_CAPACITY: usize = 100;

/// Severity of a guest message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
}

impl Severity {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" | "warning" => Self::Warning,
            _ => Self::Info,
        }
    }
}

/// One message shown by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestMessage {
    /// Severity.
    pub severity: Severity,
    /// Message text.
    pub text: String,
    /// Action labels offered with the message.
    pub actions: Vec<String>,
    /// When the host received it.
    pub received_at: DateTime<Utc>,
}

/// Logs guest messages and keeps the most recent ones for the product layer.
///
/// No UI is attached, so every message resolves with no action chosen.
#[derive(Debug, Default)]
pub struct MessageSink {
    recent: Mutex<VecDeque<GuestMessage>>,
}

impl MessageSink {
    /// Most recent messages, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<GuestMessage> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn show(&self, args: &[RpcValue]) -> ServiceResult {
        let reader = Args::new(m::SHOW_MESSAGE, args);
        let severity = Severity::parse(reader.string(0, "severity")?);
        let text = reader.string(1, "message")?.to_owned();
        let actions: Vec<String> = reader
            .value(2)
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|a| a.as_str().map(str::to_owned))
            .collect();

        match severity {
            Severity::Info => info!(actions = ?actions, "guest message: {text}"),
            Severity::Warning => warn!(actions = ?actions, "guest message: {text}"),
            Severity::Error => error!(actions = ?actions, "guest message: {text}"),
        }

        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(GuestMessage {
            severity,
            text,
            actions,
            received_at: Utc::now(),
        });
        Ok(RpcValue::Null)
    }
}

impl LocalService for MessageSink {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            m::SHOW_MESSAGE => Box::pin(async move { self.show(&args) }),
            _ => unknown_method(MainService::MessageService.name(), method),
        }
    }
}
