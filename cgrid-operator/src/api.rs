//! Participant HTTP surface.
//!
//! Remote coordinators drive this city's votes through `/2pc/prepare`,
//! `/2pc/commit` and `/2pc/abort`; `/status` exposes the live ledger.
//! Decisions are idempotent: an unknown transaction id is a no-op success.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use cgrid_core::types::{
    CityStatus, DecisionAck, ParticipantStatus, PrepareRequest, PrepareResponse, TxDecision,
};
use cgrid_core::{CgridError, CgridResult};

use crate::state::{PrepareError, StateManager};

/// Shared state of the participant API.
pub struct ApiState {
    pub operator: String,
    pub owned_city: String,
    pub state: Arc<StateManager>,
}

/// Server-side request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/2pc/prepare", post(prepare))
        .route("/2pc/commit", post(commit))
        .route("/2pc/abort", post(abort))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<ApiState>, port: u16) -> CgridResult<()> {
    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    info!("participant api listening on {addr}");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await.map_err(CgridError::Io)
}

/// Pre-protocol validation of a prepare body. Wrong-city requests and
/// malformed windows are 400s; they never reach the ledger.
fn validate_prepare(body: &PrepareRequest, owned_city: &str) -> Result<(), CgridError> {
    if body.transaction_id.trim().is_empty()
        || body.vehicle_id.trim().is_empty()
        || body.request_id.trim().is_empty()
    {
        return Err(CgridError::BadInput(
            "missing transaction_id, vehicle_id or request_id".to_string(),
        ));
    }
    if !body.reservation_window.is_valid() {
        return Err(CgridError::BadInput(
            "end time must be after start time".to_string(),
        ));
    }
    if body.city != owned_city {
        return Err(CgridError::BadInput(format!(
            "prepare addressed to {}, but this operator manages {owned_city}",
            body.city
        )));
    }
    Ok(())
}

async fn prepare(
    State(api): State<Arc<ApiState>>,
    body: Result<Json<PrepareRequest>, JsonRejection>,
) -> (StatusCode, Json<PrepareResponse>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("[{}] undecodable prepare body: {rejection}", api.operator);
            return (
                StatusCode::BAD_REQUEST,
                Json(PrepareResponse {
                    status: ParticipantStatus::Rejected,
                    transaction_id: String::new(),
                    reason: Some(format!("invalid request body: {rejection}")),
                }),
            );
        }
    };

    info!(
        "[{}] TX[{}]: received remote PREPARE for {}",
        api.operator, body.transaction_id, body.city
    );

    if let Err(e) = validate_prepare(&body, &api.owned_city) {
        warn!("[{}] TX[{}]: bad prepare: {e}", api.operator, body.transaction_id);
        return (
            StatusCode::BAD_REQUEST,
            Json(PrepareResponse {
                status: ParticipantStatus::Rejected,
                transaction_id: body.transaction_id,
                reason: Some(e.to_string()),
            }),
        );
    }

    let outcome = api
        .state
        .prepare_reservation(
            &body.transaction_id,
            &body.vehicle_id,
            &body.request_id,
            body.reservation_window,
            &body.coordinator_url,
        )
        .await;

    match outcome {
        Ok(()) => (
            StatusCode::OK,
            Json(PrepareResponse {
                status: ParticipantStatus::Prepared,
                transaction_id: body.transaction_id,
                reason: None,
            }),
        ),
        Err(e) => {
            warn!(
                "[{}] TX[{}]: PREPARE voted NO: {e}",
                api.operator, body.transaction_id
            );
            let status = match e {
                PrepareError::CapacityExceeded(_)
                | PrepareError::NoWorkerAvailable(_)
                | PrepareError::Conflict(_) => StatusCode::CONFLICT,
            };
            (
                status,
                Json(PrepareResponse {
                    status: ParticipantStatus::Rejected,
                    transaction_id: body.transaction_id,
                    reason: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn commit(
    State(api): State<Arc<ApiState>>,
    body: Result<Json<TxDecision>, JsonRejection>,
) -> (StatusCode, Json<DecisionAck>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_decision_body(&api, "commit", rejection),
    };

    info!(
        "[{}] TX[{}]: received remote COMMIT",
        api.operator, body.transaction_id
    );
    api.state.commit_reservation(&body.transaction_id).await;
    (
        StatusCode::OK,
        Json(DecisionAck {
            status: ParticipantStatus::Committed,
            transaction_id: body.transaction_id,
        }),
    )
}

async fn abort(
    State(api): State<Arc<ApiState>>,
    body: Result<Json<TxDecision>, JsonRejection>,
) -> (StatusCode, Json<DecisionAck>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_decision_body(&api, "abort", rejection),
    };

    info!(
        "[{}] TX[{}]: received remote ABORT",
        api.operator, body.transaction_id
    );
    api.state.abort_reservation(&body.transaction_id).await;
    (
        StatusCode::OK,
        Json(DecisionAck {
            status: ParticipantStatus::Aborted,
            transaction_id: body.transaction_id,
        }),
    )
}

fn bad_decision_body(
    api: &ApiState,
    action: &str,
    rejection: JsonRejection,
) -> (StatusCode, Json<DecisionAck>) {
    warn!("[{}] undecodable {action} body: {rejection}", api.operator);
    (
        StatusCode::BAD_REQUEST,
        Json(DecisionAck {
            status: ParticipantStatus::Rejected,
            transaction_id: String::new(),
        }),
    )
}

async fn status(State(api): State<Arc<ApiState>>) -> Json<CityStatus> {
    Json(api.state.status())
}
