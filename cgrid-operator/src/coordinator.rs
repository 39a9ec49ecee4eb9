//! Per-transaction 2PC coordinator.
//!
//! The operator that receives a chosen-route message coordinates that
//! transaction, and only that one: each message spawns a task that owns its
//! transaction record exclusively until the final status is published.
//!
//! PREPARE runs sequentially over the route and short-circuits on the first
//! NO vote, so the abort set is always exactly the set of recorded YES
//! votes. A participant that timed out is never committed; its late grant is
//! dropped and expires on its own.

use std::sync::Arc;

use rumqttc::QoS;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgrid_core::fabric::Fabric;
use cgrid_core::registry::RegistryClient;
use cgrid_core::types::{
    topics, ChosenRouteMsg, FinalStatus, ParticipantStatus, PrepareRequest, PrepareResponse,
    ReservationStatus, Segment, TxDecision,
};
use cgrid_core::{CgridError, OperatorConfig};

use crate::state::StateManager;

/// Everything a coordinator task needs, shared by all loops of the process.
pub struct OperatorCtx {
    pub config: OperatorConfig,
    pub fabric: Fabric,
    pub registry: RegistryClient,
    pub state: Arc<StateManager>,
    pub http: reqwest::Client,
}

/// A yes-voter for one city of the route.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Participant {
    /// Our own city; decisions are local calls.
    Local,
    /// A remote operator, addressed over HTTP.
    Remote(String),
}

/// Coordinator phases; there are no other transitions and PREPARE is never
/// retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxPhase {
    Preparing,
    Committing,
    Aborting,
    Done,
}

struct Transaction {
    tx_id: String,
    vehicle_id: String,
    request_id: String,
    route: Vec<Segment>,
    phase: TxPhase,
    /// Cities that returned PREPARED-success, in vote order. This is the
    /// exact set that receives the decision.
    prepared: Vec<(String, Participant)>,
}

/// Entry point: one chosen-route message, one transaction, one final status.
pub async fn handle_chosen_route(ctx: Arc<OperatorCtx>, payload: &[u8]) {
    let operator = &ctx.config.operator_name;

    let msg: ChosenRouteMsg = match serde_json::from_slice(payload) {
        Ok(msg) => msg,
        Err(e) => {
            // Without ids there is no one to answer; the message is dropped.
            warn!("[{operator}] undecodable chosen-route message: {e}");
            return;
        }
    };

    let tx_id = format!("tx-{}", Uuid::new_v4());

    if let Err(e) = validate_route(&msg) {
        warn!("[{operator}] TX[{tx_id}]: rejected up front: {e}");
        if !msg.vehicle_id.is_empty() {
            publish_final_status(&ctx, &tx_id, &msg, FinalStatus::Rejected, e.to_string(), None)
                .await;
        }
        return;
    }

    info!(
        "[{operator}] TX[{tx_id}]: starting 2PC for vehicle {} over {} segments",
        msg.vehicle_id,
        msg.route.len()
    );

    let mut tx = Transaction {
        tx_id: tx_id.clone(),
        vehicle_id: msg.vehicle_id.clone(),
        request_id: msg.request_id.clone(),
        route: msg.route.clone(),
        phase: TxPhase::Preparing,
        prepared: Vec::new(),
    };

    // The overall deadline bounds the PREPARE phase; on expiry whatever
    // voted YES so far is aborted.
    let prepare_outcome = tokio::time::timeout(
        ctx.config.transaction_deadline,
        prepare_all(&ctx, &mut tx),
    )
    .await;

    let failure: Option<String> = match prepare_outcome {
        Ok(Ok(())) => None,
        Ok(Err(reason)) => Some(reason),
        Err(_) => Some("transaction deadline exceeded during prepare".to_string()),
    };

    match failure {
        None => {
            tx.phase = TxPhase::Committing;
            info!(
                "[{operator}] TX[{}]: all {} segments PREPARED, committing",
                tx.tx_id,
                tx.prepared.len()
            );
            let all_acked = run_commit(&ctx, &tx).await;
            tx.phase = TxPhase::Done;

            if all_acked {
                let route = tx.route.clone();
                publish_final_status(
                    &ctx,
                    &tx.tx_id,
                    &msg,
                    FinalStatus::Confirmed,
                    "route reserved".to_string(),
                    Some(route),
                )
                .await;
            } else {
                // A participant that missed its COMMIT auto-releases on
                // PREPARED expiry; the vehicle must not treat the route as
                // reserved.
                publish_final_status(
                    &ctx,
                    &tx.tx_id,
                    &msg,
                    FinalStatus::Rejected,
                    "reservation could not be confirmed everywhere".to_string(),
                    None,
                )
                .await;
            }
        }
        Some(reason) => {
            tx.phase = TxPhase::Aborting;
            info!("[{operator}] TX[{}]: prepare failed, aborting yes-voters", tx.tx_id);
            run_abort(&ctx, &tx).await;
            tx.phase = TxPhase::Done;

            publish_final_status(&ctx, &tx.tx_id, &msg, FinalStatus::Rejected, reason, None).await;
        }
    }

    debug!("[{operator}] TX[{}]: finished in phase {:?}", tx.tx_id, tx.phase);
}

/// T0 validation: ids present, route non-empty, windows valid, and no city
/// voted twice (the city model holds one reservation per transaction).
fn validate_route(msg: &ChosenRouteMsg) -> Result<(), CgridError> {
    if msg.vehicle_id.trim().is_empty() || msg.request_id.trim().is_empty() {
        return Err(CgridError::BadInput(
            "missing vehicle_id or request_id".to_string(),
        ));
    }
    if msg.route.is_empty() {
        return Err(CgridError::BadInput("chosen route is empty".to_string()));
    }
    for segment in &msg.route {
        if segment.city.trim().is_empty() {
            return Err(CgridError::BadInput(
                "route contains a segment without a city".to_string(),
            ));
        }
        if !segment.reservation_window.is_valid() {
            return Err(CgridError::BadInput(format!(
                "invalid reservation window for {}",
                segment.city
            )));
        }
    }
    for (i, segment) in msg.route.iter().enumerate() {
        if msg.route[..i].iter().any(|s| s.city == segment.city) {
            return Err(CgridError::BadInput(format!(
                "route visits {} twice",
                segment.city
            )));
        }
    }
    Ok(())
}

/// T2: sequential PREPARE over the route; stops at the first NO.
async fn prepare_all(ctx: &Arc<OperatorCtx>, tx: &mut Transaction) -> Result<(), String> {
    for segment in &tx.route {
        let participant = prepare_segment(ctx, tx, segment).await?;
        tx.prepared.push((segment.city.clone(), participant));
    }
    Ok(())
}

async fn prepare_segment(
    ctx: &Arc<OperatorCtx>,
    tx: &Transaction,
    segment: &Segment,
) -> Result<Participant, String> {
    let operator = &ctx.config.operator_name;

    if segment.city == ctx.config.owned_city {
        info!("[{operator}] TX[{}]: local PREPARE for {}", tx.tx_id, segment.city);
        ctx.state
            .prepare_reservation(
                &tx.tx_id,
                &tx.vehicle_id,
                &tx.request_id,
                segment.reservation_window,
                &ctx.config.api_url(),
            )
            .await
            .map_err(|e| format!("{}: {e}", segment.city))?;
        return Ok(Participant::Local);
    }

    let endpoint = ctx
        .registry
        .discover(&segment.city)
        .await
        .map_err(|e| format!("registry lookup for {} failed: {e}", segment.city))?
        .ok_or_else(|| format!("no operator registered for {}", segment.city))?;

    info!(
        "[{operator}] TX[{}]: remote PREPARE for {} at {endpoint}",
        tx.tx_id, segment.city
    );

    let body = PrepareRequest {
        transaction_id: tx.tx_id.clone(),
        vehicle_id: tx.vehicle_id.clone(),
        request_id: tx.request_id.clone(),
        city: segment.city.clone(),
        reservation_window: segment.reservation_window,
        coordinator_url: ctx.config.api_url(),
    };

    let response = ctx
        .http
        .post(format!("{endpoint}/2pc/prepare"))
        .timeout(ctx.config.remote_call_timeout)
        .json(&body)
        .send()
        .await
        .map_err(|e| {
            // Re-resolve on the next transaction; the endpoint may have moved.
            ctx.registry.invalidate(&segment.city);
            format!("{} unreachable: {e}", segment.city)
        })?;

    let status = response.status();
    let parsed: Result<PrepareResponse, _> = response.json().await;

    match parsed {
        Ok(r) if status.is_success() && r.status == ParticipantStatus::Prepared => {
            Ok(Participant::Remote(endpoint))
        }
        Ok(r) => Err(format!(
            "{} voted NO ({}): {}",
            segment.city,
            status,
            r.reason.unwrap_or_else(|| "no reason given".to_string())
        )),
        Err(e) => Err(format!(
            "{} answered status {status} with undecodable body: {e}",
            segment.city
        )),
    }
}

/// T3: COMMIT every yes-voter. Transport failures are retried once, then
/// logged; returns whether every participant acknowledged.
async fn run_commit(ctx: &Arc<OperatorCtx>, tx: &Transaction) -> bool {
    let mut all_acked = true;
    for (city, participant) in &tx.prepared {
        match participant {
            Participant::Local => {
                ctx.state.commit_reservation(&tx.tx_id).await;
                info!(
                    "[{}] TX[{}]: local COMMIT for {city}",
                    ctx.config.operator_name, tx.tx_id
                );
            }
            Participant::Remote(endpoint) => {
                if !send_decision(ctx, &tx.tx_id, city, endpoint, "commit", 1).await {
                    all_acked = false;
                }
            }
        }
    }
    all_acked
}

/// T4: ABORT exactly the yes-voters. Participants that never voted receive
/// nothing.
async fn run_abort(ctx: &Arc<OperatorCtx>, tx: &Transaction) {
    for (city, participant) in &tx.prepared {
        match participant {
            Participant::Local => {
                ctx.state.abort_reservation(&tx.tx_id).await;
                info!(
                    "[{}] TX[{}]: local ABORT for {city}",
                    ctx.config.operator_name, tx.tx_id
                );
            }
            Participant::Remote(endpoint) => {
                send_decision(ctx, &tx.tx_id, city, endpoint, "abort", 0).await;
            }
        }
    }
}

/// POST a commit/abort decision to a remote participant, with best-effort
/// retries on transport failure.
async fn send_decision(
    ctx: &Arc<OperatorCtx>,
    tx_id: &str,
    city: &str,
    endpoint: &str,
    action: &str,
    retries: usize,
) -> bool {
    let operator = &ctx.config.operator_name;
    let body = TxDecision {
        transaction_id: tx_id.to_string(),
    };

    for attempt in 0..=retries {
        let sent = ctx
            .http
            .post(format!("{endpoint}/2pc/{action}"))
            .timeout(ctx.config.remote_call_timeout)
            .json(&body)
            .send()
            .await;

        match sent {
            Ok(response) if response.status().is_success() => {
                info!("[{operator}] TX[{tx_id}]: remote {action} acknowledged by {city}");
                return true;
            }
            Ok(response) => {
                warn!(
                    "[{operator}] TX[{tx_id}]: {city} answered {action} with status {}",
                    response.status()
                );
                return false;
            }
            Err(e) => {
                warn!(
                    "[{operator}] TX[{tx_id}]: {action} to {city} failed (attempt {}): {e}",
                    attempt + 1
                );
                ctx.registry.invalidate(city);
            }
        }
    }
    false
}

/// T5: exactly one final status per transaction.
async fn publish_final_status(
    ctx: &Arc<OperatorCtx>,
    tx_id: &str,
    msg: &ChosenRouteMsg,
    status: FinalStatus,
    message: String,
    confirmed_route: Option<Vec<Segment>>,
) {
    let payload = ReservationStatus {
        transaction_id: tx_id.to_string(),
        vehicle_id: msg.vehicle_id.clone(),
        request_id: msg.request_id.clone(),
        status,
        message,
        confirmed_route,
    };

    let topic = topics::reservation_status(&msg.vehicle_id);
    if let Err(e) = ctx.fabric.publish(&topic, QoS::AtMostOnce, &payload).await {
        warn!(
            "[{}] TX[{tx_id}]: failed to publish final status: {e}",
            ctx.config.operator_name
        );
    } else {
        info!(
            "[{}] TX[{tx_id}]: published {:?} to {topic}",
            ctx.config.operator_name, status
        );
    }
}
