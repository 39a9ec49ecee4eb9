//! Wire-level data model for the cgrid reservation protocol.
//!
//! Every payload on MQTT or HTTP is JSON; timestamps are UTC RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a vehicle; also the vehicle's own MQTT topic.
pub type VehicleId = String;

/// Identifier of one charging post (worker).
pub type PostId = String;

/// Identifier of one atomic reservation attempt.
pub type TxId = String;

/// Half-open UTC time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start_time_utc: DateTime<Utc>,
    pub end_time_utc: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_time_utc: start,
            end_time_utc: end,
        }
    }

    /// A window must have positive length.
    pub fn is_valid(&self) -> bool {
        self.end_time_utc > self.start_time_utc
    }

    /// Two half-open windows overlap iff `a.start < b.end && b.start < a.end`.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start_time_utc < other.end_time_utc && other.start_time_utc < self.end_time_utc
    }

    /// Whether the window has fully elapsed at `now`.
    pub fn ended_by(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time_utc
    }
}

/// Lifecycle of a reservation entry, on posts and in the city ledger.
///
/// `Aborted` and `Charged` are terminal; only `Prepared` and `Committed`
/// occupy capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "CHARGED")]
    Charged,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReservationState::Aborted | ReservationState::Charged)
    }

    /// Whether an entry in this state conflicts with overlapping windows.
    pub fn blocks(&self) -> bool {
        !self.is_terminal()
    }
}

/// One hop of a route: the unit of voting in 2PC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub city: String,
    pub reservation_window: Window,
}

/// Vehicle → operator: ask for route options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub vehicle_id: VehicleId,
    pub origin: String,
    pub destination: String,
}

/// Operator → vehicle: candidate routes. An empty list means "no path".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteReservationOptions {
    pub request_id: String,
    pub vehicle_id: VehicleId,
    pub routes: Vec<Vec<Segment>>,
}

/// Vehicle → operator: the route the vehicle wants reserved atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChosenRouteMsg {
    pub request_id: String,
    pub vehicle_id: VehicleId,
    pub route: Vec<Segment>,
}

/// Outcome of one reservation transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalStatus {
    #[serde(rename = "CONFIRMED")]
    Confirmed,
    #[serde(rename = "REJECTED")]
    Rejected,
}

/// Coordinator → vehicle: final word on a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationStatus {
    pub transaction_id: TxId,
    pub vehicle_id: VehicleId,
    pub request_id: String,
    pub status: FinalStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_route: Option<Vec<Segment>>,
}

/// Operator → vehicle: a committed reservation's window has ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationEnd {
    pub vehicle_id: VehicleId,
    pub transaction_id: TxId,
    pub end_time_utc: DateTime<Utc>,
    pub message: String,
}

/// City-manager view of one in-flight or committed reservation.
///
/// `assigned_worker` is `None` only while the capacity placeholder is waiting
/// for a post to vote; the city lock is never held across that negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveReservation {
    pub transaction_id: TxId,
    pub vehicle_id: VehicleId,
    pub request_id: String,
    pub city: String,
    pub reservation_window: Window,
    pub status: ReservationState,
    pub coordinator_url: String,
    pub assigned_worker: Option<PostId>,
    pub prepared_at: DateTime<Utc>,
}

/// City manager → post worker, on `enterprise/<op>/cp/<post>/command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum WorkerCommand {
    #[serde(rename = "QUERY_AVAILABILITY")]
    QueryAvailability { window: Window },

    #[serde(rename = "PREPARE_RESERVE_WINDOW")]
    PrepareReserveWindow { window: Window, transaction_id: TxId },

    #[serde(rename = "COMMIT")]
    Commit { transaction_id: TxId },

    #[serde(rename = "ABORT")]
    Abort { transaction_id: TxId },
}

/// Post worker → city manager, on `enterprise/<op>/cp/<post>/response`.
/// Replies are correlated by `(worker_id, transaction_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum WorkerReply {
    #[serde(rename = "AVAILABILITY_RESPONSE")]
    Availability {
        available: bool,
        window: Window,
        worker_id: PostId,
    },

    #[serde(rename = "PREPARE_RESPONSE")]
    Prepare {
        success: bool,
        transaction_id: TxId,
        worker_id: PostId,
    },
}

/// Post worker → operator, on `enterprise/<op>/cp/<post>/event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum WorkerEvent {
    #[serde(rename = "VEHICLE_PASSED_AND_CHARGED")]
    PassedAndCharged {
        transaction_id: TxId,
        cost: f64,
        window: Window,
        worker_id: PostId,
    },
}

impl WorkerCommand {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl WorkerReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl WorkerEvent {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// 2PC wire status of a participant, in HTTP bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

/// Coordinator → participant: `POST /2pc/prepare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub transaction_id: TxId,
    pub vehicle_id: VehicleId,
    pub request_id: String,
    pub city: String,
    pub reservation_window: Window,
    pub coordinator_url: String,
}

/// Participant → coordinator: answer to `/2pc/prepare`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub status: ParticipantStatus,
    pub transaction_id: TxId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Coordinator → participant: `POST /2pc/commit` and `POST /2pc/abort`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxDecision {
    pub transaction_id: TxId,
}

/// Participant → coordinator: acknowledgement of a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAck {
    pub status: ParticipantStatus,
    pub transaction_id: TxId,
}

/// Participant → anyone: `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityStatus {
    pub enterprise: String,
    pub managed_city: String,
    pub max_posts: usize,
    pub active_reservations: Vec<ActiveReservation>,
}

/// Topic scheme shared by every process on the broker.
pub mod topics {
    /// Vehicle → operator: route requests arrive on the operator's own name.
    pub fn route_requests(operator: &str) -> String {
        operator.to_string()
    }

    /// Operator → vehicle: route options go to the vehicle's own id.
    pub fn route_options(vehicle: &str) -> String {
        vehicle.to_string()
    }

    pub fn chosen_route(operator: &str) -> String {
        format!("car/route/{operator}")
    }

    pub fn reservation_status(vehicle: &str) -> String {
        format!("car/reservation/status/{vehicle}")
    }

    pub fn reservation_end(vehicle: &str) -> String {
        format!("car/reservation/end/{vehicle}")
    }

    pub fn worker_command(operator: &str, post: &str) -> String {
        format!("enterprise/{operator}/cp/{post}/command")
    }

    pub fn worker_response(operator: &str, post: &str) -> String {
        format!("enterprise/{operator}/cp/{post}/response")
    }

    pub fn worker_event(operator: &str, post: &str) -> String {
        format!("enterprise/{operator}/cp/{post}/event")
    }

    /// All responses of an operator's posts, for the reply dispatcher.
    pub fn worker_response_filter(operator: &str) -> String {
        format!("enterprise/{operator}/cp/+/response")
    }

    /// All charged-notice events of an operator's posts.
    pub fn worker_event_filter(operator: &str) -> String {
        format!("enterprise/{operator}/cp/+/event")
    }
}
