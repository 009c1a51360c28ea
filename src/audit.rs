//! Audit logging for authentication outcomes.
//!
//! Exactly one [`AuditEvent`] is recorded per terminal outcome of `authenticate`
//! and `login`, success or failure, including failures raised before a role was
//! resolved (the role is then absent).
//!
//! [`TracingAuditSink`] emits each event via `tracing::info!` with the event
//! serialized into the `audit` field, so the trail is queryable by any log
//! aggregator:
//!
//! ```text
//! INFO authn_core::audit audit={"event":"authn.failure","authenticator":"authn-jwt",...}
//! ```

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Structured audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type (`authn.success`, `authn.failure`, `login.success`, `login.failure`).
    pub event: &'static str,
    /// Authenticator type.
    pub authenticator: String,
    /// Webservice resource id, when the request named a valid one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Resolved or claimed role id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Outcome.
    pub success: bool,
    /// Failure reason or success note.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Client origin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<IpAddr>,
    /// Time of the outcome.
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    /// Outcome of an `authenticate` call.
    #[must_use]
    pub fn authentication(
        authenticator: impl Into<String>,
        service: Option<String>,
        role: Option<String>,
        success: bool,
        message: Option<String>,
    ) -> Self {
        Self {
            event: if success { "authn.success" } else { "authn.failure" },
            authenticator: authenticator.into(),
            service,
            role,
            success,
            message,
            client_ip: None,
            timestamp: Utc::now(),
        }
    }

    /// Outcome of a `login` call.
    #[must_use]
    pub fn login(
        authenticator: impl Into<String>,
        role: Option<String>,
        success: bool,
        message: Option<String>,
    ) -> Self {
        Self {
            event: if success { "login.success" } else { "login.failure" },
            authenticator: authenticator.into(),
            service: None,
            role,
            success,
            message,
            client_ip: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the client origin.
    #[must_use]
    pub fn with_client_ip(mut self, client_ip: Option<IpAddr>) -> Self {
        self.client_ip = client_ip;
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Record one event. Must not fail the caller.
    fn record(&self, event: AuditEvent);
}

/// Sink that writes events to the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        emit(&event);
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "authn audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_event_has_correct_type() {
        // GIVEN/WHEN: a successful authentication event
        let event = AuditEvent::authentication(
            "authn-jwt",
            Some("acme:webservice:conjur/authn-jwt/gitlab".into()),
            Some("acme:host:ci".into()),
            true,
            None,
        );

        // THEN
        assert_eq!(event.event, "authn.success");
        assert!(event.success);
    }

    #[test]
    fn failure_without_role_omits_role_field() {
        // GIVEN: a failure raised before a role was resolved
        let event = AuditEvent::authentication(
            "authn-jwt",
            None,
            None,
            false,
            Some("Account 'acme' is not defined".into()),
        );

        // WHEN: serialized
        let json = serde_json::to_value(&event).unwrap();

        // THEN: role and service are absent, message present
        assert_eq!(json["event"], "authn.failure");
        assert!(json.get("role").is_none());
        assert!(json.get("service").is_none());
        assert_eq!(json["message"], "Account 'acme' is not defined");
    }

    #[test]
    fn login_event_carries_client_ip() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let event = AuditEvent::login("authn", Some("acme:user:alice".into()), false, None)
            .with_client_ip(Some(ip));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "login.failure");
        assert_eq!(json["client_ip"], "10.0.0.7");
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::login("authn", None, true, None));
        TracingAuditSink.record(AuditEvent::login("authn", None, true, None));
    }
}
