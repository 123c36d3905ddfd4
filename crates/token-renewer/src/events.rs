//! Event reporting for evaluations.
//!
//! Every terminal outcome of an evaluation, successful or not, is reported to
//! an [`EventSink`] with a stable [`Reason`]. Emitting is fire-and-forget: a
//! sink that fails to deliver must not affect the evaluation.

use crate::model::ObjectKey;
use core::fmt;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

/// Stable reason codes attached to events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    PolicyInvalid,
    MetadataEmpty,
    SecretNotFound,
    StoreReadError,
    TokenKeyNotFound,
    TokenEmpty,
    TokenInvalid,
    ProviderNotFound,
    RegistryClosed,
    TokenValidityError,
    TokenRenewalError,
    SecretUpdateError,
    TokenUpdateError,
    SecretUpdated,
    TokenUpdated,
    TokenRenewed,
}

impl Reason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PolicyInvalid => "PolicyInvalid",
            Self::MetadataEmpty => "MetadataEmpty",
            Self::SecretNotFound => "SecretNotFound",
            Self::StoreReadError => "StoreReadError",
            Self::TokenKeyNotFound => "TokenKeyNotFound",
            Self::TokenEmpty => "TokenEmpty",
            Self::TokenInvalid => "TokenInvalid",
            Self::ProviderNotFound => "ProviderNotFound",
            Self::RegistryClosed => "RegistryClosed",
            Self::TokenValidityError => "TokenValidityError",
            Self::TokenRenewalError => "TokenRenewalError",
            Self::SecretUpdateError => "SecretUpdateError",
            Self::TokenUpdateError => "TokenUpdateError",
            Self::SecretUpdated => "SecretUpdated",
            Self::TokenUpdated => "TokenUpdated",
            Self::TokenRenewed => "TokenRenewed",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, subject: &ObjectKey, severity: Severity, reason: Reason, message: &str);
}

impl<T> EventSink for Arc<T>
where
    T: EventSink + ?Sized,
{
    fn emit(&self, subject: &ObjectKey, severity: Severity, reason: Reason, message: &str) {
        (**self).emit(subject, severity, reason, message);
    }
}

/// Reports events as structured log records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, subject: &ObjectKey, severity: Severity, reason: Reason, message: &str) {
        match severity {
            Severity::Normal => tracing::info!(
                target: "token_renewer::events",
                policy = %subject,
                reason = reason.as_str(),
                "{message}"
            ),
            Severity::Warning => tracing::warn!(
                target: "token_renewer::events",
                policy = %subject,
                reason = reason.as_str(),
                "{message}"
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub subject: ObjectKey,
    pub severity: Severity,
    pub reason: Reason,
    pub message: String,
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<Reason> {
        self.events.lock().iter().map(|e| e.reason).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, subject: &ObjectKey, severity: Severity, reason: Reason, message: &str) {
        self.events.lock().push(Event {
            subject: subject.clone(),
            severity,
            reason,
            message: message.to_string(),
        });
    }
}
