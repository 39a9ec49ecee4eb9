//! Operator process wiring.
//!
//! Connects the fabric, registers with the service registry, then runs the
//! long-lived tasks: the route-request consumer, the chosen-route consumer
//! (which spawns one coordinator task per message), the expiry sweeper, the
//! charged-notice listener and the participant HTTP server.

use std::sync::Arc;

use chrono::Utc;
use rumqttc::QoS;
use tracing::{error, info, warn};
use uuid::Uuid;

use cgrid_core::fabric::Fabric;
use cgrid_core::registry::RegistryClient;
use cgrid_core::types::{
    topics, ReservationEnd, RouteRequest, RouteReservationOptions, WorkerEvent,
};
use cgrid_core::{CgridError, CgridResult, OperatorConfig};

use crate::api::{self, ApiState};
use crate::coordinator::{self, OperatorCtx};
use crate::planner;
use crate::state::StateManager;

const ROUTE_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One operator instance: the process-level owner of everything in §4.
pub struct Operator {
    ctx: Arc<OperatorCtx>,
}

impl Operator {
    /// Connect to the broker and the registry and build the shared context.
    /// Any failure here is fatal; the process must exit non-zero.
    pub async fn bootstrap(config: OperatorConfig) -> CgridResult<Self> {
        config.validate()?;

        let client_id = format!("operator-{}", config.operator_name);
        let fabric = Fabric::connect(&config.mqtt_broker_url, &client_id).await?;

        let registry = RegistryClient::new(&config.registry_url)?;
        registry
            .register(&config.operator_name, &config.owned_city, &config.api_url())
            .await?;

        let state = StateManager::new(
            config.operator_name.clone(),
            config.owned_city.clone(),
            config.posts_quantity,
            config.worker_ids.clone(),
            config.worker_reply_timeout,
            config.prepared_ttl,
            fabric.clone(),
        )
        .await?;

        let http = reqwest::Client::builder()
            .timeout(config.remote_call_timeout)
            .build()
            .map_err(|e| CgridError::RemoteUnavailable(e.to_string()))?;

        info!(
            "operator {} bootstrapped: city {}, {} posts, api {}",
            config.operator_name,
            config.owned_city,
            config.posts_quantity,
            config.api_url()
        );

        Ok(Self {
            ctx: Arc::new(OperatorCtx {
                config,
                fabric,
                registry,
                state,
                http,
            }),
        })
    }

    /// Run until the HTTP server stops.
    pub async fn run(self) -> CgridResult<()> {
        let ctx = self.ctx;

        tokio::spawn(route_request_loop(ctx.clone()));
        tokio::spawn(chosen_route_loop(ctx.clone()));
        tokio::spawn(sweep_loop(ctx.clone()));
        tokio::spawn(worker_event_loop(ctx.clone()));

        let api_state = Arc::new(ApiState {
            operator: ctx.config.operator_name.clone(),
            owned_city: ctx.config.owned_city.clone(),
            state: ctx.state.clone(),
        });
        api::serve(api_state, ctx.config.http_port).await
    }
}

/// Consume vehicle route requests and answer with route options.
async fn route_request_loop(ctx: Arc<OperatorCtx>) {
    let operator = ctx.config.operator_name.clone();
    let mut sub = match ctx
        .fabric
        .subscribe(
            &topics::route_requests(&operator),
            QoS::AtLeastOnce,
            ROUTE_CHANNEL_CAPACITY,
        )
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            error!("[{operator}] cannot subscribe to route requests: {e}");
            return;
        }
    };

    while let Some(message) = sub.recv().await {
        let request: RouteRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("[{operator}] undecodable route request: {e}");
                continue;
            }
        };
        if request.vehicle_id.trim().is_empty() {
            warn!("[{operator}] route request without vehicle_id, dropping");
            continue;
        }

        let request_id = Uuid::new_v4().to_string();
        let routes = planner::generate_routes(
            &request.origin,
            &request.destination,
            Utc::now(),
            &ctx.config.planner,
        );
        info!(
            "[{operator}] offering {} route(s) to {} for {} -> {}",
            routes.len(),
            request.vehicle_id,
            request.origin,
            request.destination
        );

        let options = RouteReservationOptions {
            request_id,
            vehicle_id: request.vehicle_id.clone(),
            routes,
        };
        let topic = topics::route_options(&request.vehicle_id);
        if let Err(e) = ctx.fabric.publish(&topic, QoS::AtMostOnce, &options).await {
            warn!("[{operator}] failed to publish route options: {e}");
        }
    }
}

/// Consume chosen routes; each message gets its own coordinator task.
async fn chosen_route_loop(ctx: Arc<OperatorCtx>) {
    let operator = ctx.config.operator_name.clone();
    let mut sub = match ctx
        .fabric
        .subscribe(
            &topics::chosen_route(&operator),
            QoS::AtLeastOnce,
            ROUTE_CHANNEL_CAPACITY,
        )
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            error!("[{operator}] cannot subscribe to chosen routes: {e}");
            return;
        }
    };

    while let Some(message) = sub.recv().await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            coordinator::handle_chosen_route(ctx, &message.payload).await;
        });
    }
}

/// Periodic expiry sweep; ended reservations are announced to the vehicle.
async fn sweep_loop(ctx: Arc<OperatorCtx>) {
    let mut ticker = tokio::time::interval(ctx.config.sweep_interval);
    loop {
        ticker.tick().await;
        let ended = ctx.state.sweep(Utc::now()).await;

        for reservation in ended {
            let notice = ReservationEnd {
                vehicle_id: reservation.vehicle_id.clone(),
                transaction_id: reservation.transaction_id.clone(),
                end_time_utc: reservation.reservation_window.end_time_utc,
                message: "reservation window ended".to_string(),
            };
            let topic = topics::reservation_end(&reservation.vehicle_id);
            if let Err(e) = ctx.fabric.publish(&topic, QoS::AtMostOnce, &notice).await {
                warn!(
                    "[{}] failed to publish reservation end for {}: {e}",
                    ctx.config.operator_name, reservation.transaction_id
                );
            }
        }
    }
}

/// Log charged notices from this operator's posts. The post's own sweep is
/// authoritative for charging; this is observability only.
async fn worker_event_loop(ctx: Arc<OperatorCtx>) {
    let operator = ctx.config.operator_name.clone();
    let mut sub = match ctx
        .fabric
        .subscribe(
            &topics::worker_event_filter(&operator),
            QoS::AtLeastOnce,
            EVENT_CHANNEL_CAPACITY,
        )
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            error!("[{operator}] cannot subscribe to worker events: {e}");
            return;
        }
    };

    while let Some(message) = sub.recv().await {
        match WorkerEvent::from_bytes(&message.payload) {
            Ok(WorkerEvent::PassedAndCharged {
                transaction_id,
                cost,
                worker_id,
                ..
            }) => {
                info!(
                    "[{operator}] post {worker_id} charged {cost:.2} for {transaction_id}"
                );
            }
            Err(e) => warn!("[{operator}] undecodable worker event: {e}"),
        }
    }
}
