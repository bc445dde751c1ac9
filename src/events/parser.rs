//! Parsing of external event payloads into normalized intents.
//!
//! The intake endpoint accepts one JSON object per request, tagged by an
//! `event` field. Unknown event kinds and malformed payloads are rejected;
//! nothing partial ever reaches the store.

use serde::Deserialize;
use thiserror::Error;

use crate::types::{
    ArtifactRef, BranchId, DesiredStateEntry, Generation, IntentAction, OwnerId, SourceEvent,
};

/// Errors from payload parsing and normalization.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{event} event requires an artifact ref")]
    MissingArtifact { event: &'static str },

    #[error("unsupported manual action {0:?}")]
    UnsupportedAction(String),
}

/// Wire shape of an intake event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    /// A branch received new commits; its artifact ref is the build output.
    BranchPush {
        owner: String,
        branch: String,
        artifact: String,
        generation: u64,
    },

    /// A branch was deleted or merged away.
    BranchRemoved {
        owner: String,
        branch: String,
        generation: u64,
    },

    /// An operator acting directly.
    ManualRequest {
        requester: String,
        owner: String,
        branch: String,
        action: String,
        #[serde(default)]
        artifact: Option<String>,
        generation: u64,
    },
}

/// Parses a raw intake body.
pub fn parse_event(body: &[u8]) -> Result<EventPayload, ParseError> {
    Ok(serde_json::from_slice(body)?)
}

/// Normalizes a parsed payload into a desired-state intent.
pub fn normalize(payload: EventPayload) -> Result<DesiredStateEntry, ParseError> {
    match payload {
        EventPayload::BranchPush {
            owner,
            branch,
            artifact,
            generation,
        } => Ok(DesiredStateEntry::new(
            OwnerId::new(owner),
            BranchId::new(branch),
            IntentAction::Create {
                artifact: ArtifactRef::new(artifact),
            },
            Generation(generation),
            SourceEvent::BranchPush,
        )),
        EventPayload::BranchRemoved {
            owner,
            branch,
            generation,
        } => Ok(DesiredStateEntry::new(
            OwnerId::new(owner),
            BranchId::new(branch),
            IntentAction::Destroy,
            Generation(generation),
            SourceEvent::BranchRemoved,
        )),
        EventPayload::ManualRequest {
            requester,
            owner,
            branch,
            action,
            artifact,
            generation,
        } => {
            let action = match action.as_str() {
                "create" => IntentAction::Create {
                    artifact: ArtifactRef::new(artifact.ok_or(ParseError::MissingArtifact {
                        event: "manual create",
                    })?),
                },
                "update" => IntentAction::Update {
                    artifact: ArtifactRef::new(artifact.ok_or(ParseError::MissingArtifact {
                        event: "manual update",
                    })?),
                },
                "destroy" => IntentAction::Destroy,
                other => return Err(ParseError::UnsupportedAction(other.to_string())),
            };
            Ok(DesiredStateEntry::new(
                OwnerId::new(owner),
                BranchId::new(branch),
                action,
                Generation(generation),
                SourceEvent::ManualRequest { requester },
            ))
        }
    }
}
