//! Event intake endpoint.
//!
//! Accepts one JSON event per request, verifies the signature before any
//! parsing when a secret is configured, normalizes the payload into an
//! intent and submits it. Returns 202 for accepted and stale events alike;
//! stale is not an error, it is ordering doing its job.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

use super::AppState;
use crate::events::{normalize, parse_event, verify_signature, ParseError, SourceError,
    SIGNATURE_HEADER};
use crate::store::ApplyOutcome;

/// Errors that can occur during intake.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        let status = match &self {
            IntakeError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            IntakeError::InvalidSignature => StatusCode::UNAUTHORIZED,
            IntakeError::Parse(_) => StatusCode::BAD_REQUEST,
            IntakeError::Source(SourceError::OwnershipDenied { .. }) => StatusCode::FORBIDDEN,
            IntakeError::Source(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Intake handler. Returns 202 once the intent is applied (or discarded
/// as stale); reconciliation happens asynchronously.
pub async fn events_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), IntakeError> {
    if let Some(secret) = app_state.event_secret() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(IntakeError::MissingHeader(SIGNATURE_HEADER))?;
        if !verify_signature(&body, signature, secret) {
            warn!("Rejected event with invalid signature");
            return Err(IntakeError::InvalidSignature);
        }
    }

    let entry = normalize(parse_event(&body)?)?;
    let outcome = app_state.source().submit(entry)?;

    let message = match outcome {
        ApplyOutcome::Stale => "Accepted (stale, discarded)",
        ApplyOutcome::NoOp => "Accepted (no-op)",
        _ => "Accepted",
    };
    Ok((StatusCode::ACCEPTED, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::signature::{compute_signature, format_signature_header};
    use crate::server::test_support::app_state;
    use axum::http::HeaderValue;

    fn push_body(generation: u64) -> Vec<u8> {
        format!(
            r#"{{"event":"branch_push","owner":"d1","branch":"f1","artifact":"app:{generation}","generation":{generation}}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn unsigned_intake_accepted_without_secret() {
        let (state, mut rx) = app_state(None);
        let (status, _) = events_handler(
            State(state),
            HeaderMap::new(),
            Bytes::from(push_body(1)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn missing_signature_rejected_with_secret() {
        let (state, _rx) = app_state(Some(b"secret"));
        let err = events_handler(State(state), HeaderMap::new(), Bytes::from(push_body(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::MissingHeader(_)));
    }

    #[tokio::test]
    async fn bad_signature_rejected() {
        let (state, _rx) = app_state(Some(b"secret"));
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_static("sha256=deadbeef"),
        );
        let err = events_handler(State(state), headers, Bytes::from(push_body(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::InvalidSignature));
    }

    #[tokio::test]
    async fn valid_signature_accepted() {
        let (state, _rx) = app_state(Some(b"secret"));
        let body = push_body(1);
        let header = format_signature_header(&compute_signature(&body, b"secret"));
        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&header).unwrap());

        let (status, _) = events_handler(State(state), headers, Bytes::from(body))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn stale_event_still_returns_accepted() {
        let (state, _rx) = app_state(None);
        events_handler(
            State(state.clone()),
            HeaderMap::new(),
            Bytes::from(push_body(5)),
        )
        .await
        .unwrap();
        let (status, message) = events_handler(
            State(state),
            HeaderMap::new(),
            Bytes::from(push_body(3)),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(message, "Accepted (stale, discarded)");
    }

    #[tokio::test]
    async fn malformed_body_rejected() {
        let (state, _rx) = app_state(None);
        let err = events_handler(
            State(state),
            HeaderMap::new(),
            Bytes::from_static(b"{not json"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IntakeError::Parse(_)));
    }
}
