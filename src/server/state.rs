//! State inspection and promotion endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::promotion::{PromotionError, PromotionRequest, RequestDisposition};
use crate::types::{BranchId, EnvironmentId, OwnerId};

/// Returns every known environment record.
pub async fn environments_handler(State(app_state): State<AppState>) -> Response {
    Json(app_state.store().list()).into_response()
}

/// Returns one environment record by canonical identity.
pub async fn environment_handler(
    State(app_state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match app_state.store().get(&EnvironmentId::new(id)) {
        Some(env) => Json(env).into_response(),
        None => (StatusCode::NOT_FOUND, "no such environment").into_response(),
    }
}

/// Wire shape of a promotion request.
#[derive(Debug, Deserialize)]
pub struct PromotionRequestBody {
    pub requester: String,
    pub sources: Vec<PairBody>,
    pub target: PairBody,
}

#[derive(Debug, Deserialize)]
pub struct PairBody {
    pub owner: String,
    pub branch: String,
}

impl PairBody {
    fn into_pair(self) -> (OwnerId, BranchId) {
        (OwnerId::new(self.owner), BranchId::new(self.branch))
    }
}

fn promotion_error_response(error: PromotionError) -> Response {
    let status = match &error {
        PromotionError::Busy { .. } => StatusCode::CONFLICT,
        PromotionError::NoSources => StatusCode::BAD_REQUEST,
        PromotionError::UnknownSource { .. } => StatusCode::NOT_FOUND,
        PromotionError::Source(crate::events::SourceError::OwnershipDenied { .. }) => {
            StatusCode::FORBIDDEN
        }
        PromotionError::Source(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}

/// Submits a promotion request.
pub async fn promotion_request_handler(
    State(app_state): State<AppState>,
    Json(body): Json<PromotionRequestBody>,
) -> Response {
    let request = PromotionRequest {
        requester: body.requester,
        sources: body.sources.into_iter().map(PairBody::into_pair).collect(),
        target: body.target.into_pair(),
    };

    match app_state.promotions().request(request) {
        Ok(RequestDisposition::Started(record)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "disposition": "started", "record": record })),
        )
            .into_response(),
        Ok(RequestDisposition::Queued { position }) => (
            StatusCode::ACCEPTED,
            Json(json!({ "disposition": "queued", "position": position })),
        )
            .into_response(),
        Err(error) => promotion_error_response(error),
    }
}

/// Reports a target's promotion queue.
pub async fn promotion_status_handler(
    State(app_state): State<AppState>,
    Path((owner, branch)): Path<(String, String)>,
) -> Response {
    let status = app_state
        .promotions()
        .status(&(OwnerId::new(owner), BranchId::new(branch)));
    Json(json!({
        "in_flight": status.in_flight,
        "queued": status.queued,
        "history": status.history,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::app_state;
    use crate::types::{
        ArtifactRef, DesiredStateEntry, Generation, IntentAction, SourceEvent,
    };

    fn seed(state: &AppState, owner: &str, branch: &str, artifact: &str) -> EnvironmentId {
        let entry = DesiredStateEntry::new(
            OwnerId::new(owner),
            BranchId::new(branch),
            IntentAction::Create {
                artifact: ArtifactRef::new(artifact),
            },
            Generation(1),
            SourceEvent::BranchPush,
        );
        state
            .source()
            .submit(entry)
            .unwrap()
            .environment_id()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn environment_lookup_hits_and_misses() {
        let (state, _rx) = app_state(None);
        let id = seed(&state, "d1", "f1", "app:1");

        let found = environment_handler(State(state.clone()), Path(id.as_str().to_string())).await;
        assert_eq!(found.status(), StatusCode::OK);

        let missing = environment_handler(State(state), Path("nope".to_string())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn promotion_request_starts_and_conflicts() {
        let (state, _rx) = app_state(None);
        seed(&state, "d1", "f1", "app:1");

        let body = PromotionRequestBody {
            requester: "release-bot".into(),
            sources: vec![PairBody {
                owner: "d1".into(),
                branch: "f1".into(),
            }],
            target: PairBody {
                owner: "team".into(),
                branch: "integration".into(),
            },
        };
        let response = promotion_request_handler(State(state.clone()), Json(body)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let missing_source = PromotionRequestBody {
            requester: "release-bot".into(),
            sources: vec![PairBody {
                owner: "ghost".into(),
                branch: "gone".into(),
            }],
            target: PairBody {
                owner: "team".into(),
                branch: "integration".into(),
            },
        };
        let response = promotion_request_handler(State(state), Json(missing_source)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn promotion_status_is_empty_for_unknown_target() {
        let (state, _rx) = app_state(None);
        let response = promotion_status_handler(
            State(state),
            Path(("team".to_string(), "integration".to_string())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
