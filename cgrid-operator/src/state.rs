//! City state manager.
//!
//! Owns the city's capacity and its active-reservation ledger, and drives
//! the local PREPARE vote across the city's post workers over MQTT.
//!
//! The capacity check and the ledger insert are atomic under the city lock,
//! but the lock is never held across a network call: `prepare_reservation`
//! inserts a capacity placeholder first, negotiates with workers unlocked,
//! then either records the granting worker or removes the placeholder.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use parking_lot::Mutex;
use rumqttc::QoS;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use cgrid_core::fabric::Fabric;
use cgrid_core::types::{
    topics, ActiveReservation, CityStatus, PostId, ReservationState, TxId, Window, WorkerCommand,
    WorkerReply,
};
use cgrid_core::CgridResult;

const REPLY_CHANNEL_CAPACITY: usize = 64;

/// Why a local PREPARE voted NO.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// Every post is taken for an overlapping window.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Capacity was free but no individual post granted the window.
    #[error("no charging post available: {0}")]
    NoWorkerAvailable(String),

    /// A PREPARE for this transaction already exists with another window.
    #[error("conflicting prepare: {0}")]
    Conflict(String),
}

/// Outcome of the ledger-side half of a PREPARE.
#[derive(Debug)]
pub enum BeginPrepare {
    /// Placeholder inserted; the worker vote must follow.
    Inserted,
    /// The same `(transaction, window)` is already held; idempotent success.
    AlreadyPrepared,
}

/// The pure capacity ledger of one city. All methods are plain state
/// transitions so the property tests can drive them without a broker.
#[derive(Debug)]
pub struct CityLedger {
    city: String,
    max_posts: usize,
    active: Vec<ActiveReservation>,
}

/// Reservations removed by one sweep tick.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// COMMITTED entries whose window has ended.
    pub ended: Vec<ActiveReservation>,
    /// PREPARED entries whose coordinator never decided.
    pub stale: Vec<ActiveReservation>,
}

impl CityLedger {
    pub fn new(city: impl Into<String>, max_posts: usize) -> Self {
        Self {
            city: city.into(),
            max_posts,
            active: Vec::new(),
        }
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    /// Count reservations that block `window` for `transaction_id`:
    /// COMMITTED entries plus PREPARED entries of other transactions.
    fn overlapping(&self, transaction_id: &str, window: &Window) -> usize {
        self.active
            .iter()
            .filter(|r| {
                let blocks = r.status == ReservationState::Committed
                    || (r.status == ReservationState::Prepared
                        && r.transaction_id != transaction_id);
                blocks && r.reservation_window.overlaps(window)
            })
            .count()
    }

    pub fn begin_prepare(
        &mut self,
        transaction_id: &str,
        vehicle_id: &str,
        request_id: &str,
        window: Window,
        coordinator_url: &str,
        now: DateTime<Utc>,
    ) -> Result<BeginPrepare, PrepareError> {
        if let Some(existing) = self
            .active
            .iter()
            .find(|r| r.transaction_id == transaction_id && !r.status.is_terminal())
        {
            if existing.reservation_window == window {
                return Ok(BeginPrepare::AlreadyPrepared);
            }
            return Err(PrepareError::Conflict(format!(
                "transaction {transaction_id} already holds a different window in {}",
                self.city
            )));
        }

        let overlapping = self.overlapping(transaction_id, &window);
        if overlapping >= self.max_posts {
            return Err(PrepareError::CapacityExceeded(format!(
                "all {overlapping}/{} posts taken for the requested window in {}",
                self.max_posts, self.city
            )));
        }

        self.active.push(ActiveReservation {
            transaction_id: transaction_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            request_id: request_id.to_string(),
            city: self.city.clone(),
            reservation_window: window,
            status: ReservationState::Prepared,
            coordinator_url: coordinator_url.to_string(),
            assigned_worker: None,
            prepared_at: now,
        });
        Ok(BeginPrepare::Inserted)
    }

    /// Record which post granted the vote for `transaction_id`.
    pub fn assign_worker(&mut self, transaction_id: &str, worker_id: &str) -> bool {
        for r in &mut self.active {
            if r.transaction_id == transaction_id && r.status == ReservationState::Prepared {
                r.assigned_worker = Some(worker_id.to_string());
                return true;
            }
        }
        false
    }

    /// Remove the placeholder of a vote that found no worker.
    pub fn cancel_pending(&mut self, transaction_id: &str) {
        self.active.retain(|r| {
            !(r.transaction_id == transaction_id
                && r.status == ReservationState::Prepared
                && r.assigned_worker.is_none())
        });
    }

    /// Flip PREPARED entries of the transaction to COMMITTED; returns the
    /// posts that must be told. Idempotent; unknown transactions yield
    /// nothing.
    pub fn commit(&mut self, transaction_id: &str) -> Vec<PostId> {
        let mut workers = Vec::new();
        for r in &mut self.active {
            if r.transaction_id == transaction_id && r.status == ReservationState::Prepared {
                r.status = ReservationState::Committed;
                if let Some(worker) = &r.assigned_worker {
                    workers.push(worker.clone());
                }
            }
        }
        workers
    }

    /// Remove PREPARED entries of the transaction; returns the posts that
    /// must be told. Idempotent.
    pub fn abort(&mut self, transaction_id: &str) -> Vec<PostId> {
        let mut workers = Vec::new();
        self.active.retain(|r| {
            if r.transaction_id == transaction_id && r.status == ReservationState::Prepared {
                if let Some(worker) = &r.assigned_worker {
                    workers.push(worker.clone());
                }
                false
            } else {
                true
            }
        });
        workers
    }

    /// Remove ended COMMITTED reservations and stale PREPARED ones.
    pub fn sweep(&mut self, now: DateTime<Utc>, prepared_ttl: TimeDelta) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        self.active.retain(|r| {
            if r.status == ReservationState::Committed && r.reservation_window.ended_by(now) {
                outcome.ended.push(r.clone());
                false
            } else if r.status == ReservationState::Prepared && now - r.prepared_at >= prepared_ttl
            {
                outcome.stale.push(r.clone());
                false
            } else {
                true
            }
        });
        outcome
    }

    fn snapshot(&self) -> Vec<ActiveReservation> {
        self.active.clone()
    }

    pub fn max_posts(&self) -> usize {
        self.max_posts
    }

    pub fn active(&self) -> &[ActiveReservation] {
        &self.active
    }
}

type PendingKey = (PostId, TxId);

/// City state manager: the ledger plus the MQTT conversation with the
/// city's post workers.
pub struct StateManager {
    operator: String,
    worker_ids: Vec<PostId>,
    reply_timeout: Duration,
    prepared_ttl: TimeDelta,
    fabric: Fabric,
    ledger: Mutex<CityLedger>,
    pending: Arc<Mutex<HashMap<PendingKey, oneshot::Sender<bool>>>>,
}

impl StateManager {
    /// Build the manager and start the worker-reply dispatcher, which
    /// correlates replies to waiting votes by `(worker_id, transaction_id)`.
    pub async fn new(
        operator: impl Into<String>,
        city: impl Into<String>,
        max_posts: usize,
        worker_ids: Vec<PostId>,
        reply_timeout: Duration,
        prepared_ttl: Duration,
        fabric: Fabric,
    ) -> CgridResult<Arc<Self>> {
        let operator = operator.into();
        let manager = Arc::new(Self {
            operator: operator.clone(),
            worker_ids,
            reply_timeout,
            prepared_ttl: TimeDelta::seconds(prepared_ttl.as_secs() as i64),
            fabric: fabric.clone(),
            ledger: Mutex::new(CityLedger::new(city, max_posts)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        });

        let mut replies = fabric
            .subscribe(
                &topics::worker_response_filter(&operator),
                QoS::AtLeastOnce,
                REPLY_CHANNEL_CAPACITY,
            )
            .await?;

        let pending = manager.pending.clone();
        tokio::spawn(async move {
            while let Some(message) = replies.recv().await {
                match WorkerReply::from_bytes(&message.payload) {
                    Ok(WorkerReply::Prepare {
                        success,
                        transaction_id,
                        worker_id,
                    }) => {
                        let waiter = pending.lock().remove(&(worker_id.clone(), transaction_id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(success);
                            }
                            None => {
                                // The vote already timed out; the decision
                                // must not flip, so the late grant is dropped
                                // and the worker's entry expires on its own.
                                debug!("dropping late prepare reply from {worker_id}");
                            }
                        }
                    }
                    Ok(WorkerReply::Availability { .. }) => {}
                    Err(e) => {
                        warn!("undecodable worker reply on {}: {e}", message.topic);
                    }
                }
            }
        });

        Ok(manager)
    }

    /// Local PREPARE: capacity check, then one post is asked to hold the
    /// window. Returns `Ok` iff this city votes YES.
    pub async fn prepare_reservation(
        &self,
        transaction_id: &str,
        vehicle_id: &str,
        request_id: &str,
        window: Window,
        coordinator_url: &str,
    ) -> Result<(), PrepareError> {
        let begun = self.ledger.lock().begin_prepare(
            transaction_id,
            vehicle_id,
            request_id,
            window,
            coordinator_url,
            Utc::now(),
        )?;
        if let BeginPrepare::AlreadyPrepared = begun {
            info!(
                "[{}] duplicate PREPARE for {transaction_id}, already held",
                self.operator
            );
            return Ok(());
        }

        match self.find_and_prepare_worker(transaction_id, window).await {
            Some(worker_id) => {
                self.ledger.lock().assign_worker(transaction_id, &worker_id);
                info!(
                    "[{}] PREPARE ok for {transaction_id}, post {worker_id} allocated",
                    self.operator
                );
                Ok(())
            }
            None => {
                self.ledger.lock().cancel_pending(transaction_id);
                Err(PrepareError::NoWorkerAvailable(format!(
                    "no post in {} granted the requested window",
                    self.city_name()
                )))
            }
        }
    }

    /// Ask each post in deterministic order until one grants the window
    /// within the per-worker deadline.
    async fn find_and_prepare_worker(&self, transaction_id: &str, window: Window) -> Option<PostId> {
        for worker_id in &self.worker_ids {
            debug!(
                "[{}] asking post {worker_id} to prepare {transaction_id}",
                self.operator
            );

            let (tx, rx) = oneshot::channel();
            let key = (worker_id.clone(), transaction_id.to_string());
            self.pending.lock().insert(key.clone(), tx);

            let command = WorkerCommand::PrepareReserveWindow {
                window,
                transaction_id: transaction_id.to_string(),
            };
            let topic = topics::worker_command(&self.operator, worker_id);
            if let Err(e) = self.fabric.publish(&topic, QoS::AtLeastOnce, &command).await {
                warn!("[{}] failed to reach post {worker_id}: {e}", self.operator);
                self.pending.lock().remove(&key);
                continue;
            }

            match tokio::time::timeout(self.reply_timeout, rx).await {
                Ok(Ok(true)) => return Some(worker_id.clone()),
                Ok(Ok(false)) => {
                    debug!("[{}] post {worker_id} voted NO", self.operator);
                }
                Ok(Err(_)) => {
                    warn!("[{}] reply channel closed for post {worker_id}", self.operator);
                    self.pending.lock().remove(&key);
                }
                Err(_) => {
                    warn!(
                        "[{}] timeout waiting for post {worker_id} on {transaction_id}",
                        self.operator
                    );
                    self.pending.lock().remove(&key);
                }
            }
        }
        None
    }

    /// COMMIT decision. Succeeds locally even if a worker send fails; the
    /// worker learns by redelivery or lets its PREPARED entry expire.
    pub async fn commit_reservation(&self, transaction_id: &str) {
        let workers = self.ledger.lock().commit(transaction_id);
        if workers.is_empty() {
            warn!(
                "[{}] COMMIT for {transaction_id}: no PREPARED reservation, no-op",
                self.operator
            );
            return;
        }
        info!("[{}] COMMITTED {transaction_id}", self.operator);
        self.notify_workers(
            &workers,
            WorkerCommand::Commit {
                transaction_id: transaction_id.to_string(),
            },
        )
        .await;
    }

    /// ABORT decision; same local-success contract as commit.
    pub async fn abort_reservation(&self, transaction_id: &str) {
        let workers = self.ledger.lock().abort(transaction_id);
        if workers.is_empty() {
            warn!(
                "[{}] ABORT for {transaction_id}: no PREPARED reservation, no-op",
                self.operator
            );
            return;
        }
        info!("[{}] ABORTED {transaction_id}", self.operator);
        self.notify_workers(
            &workers,
            WorkerCommand::Abort {
                transaction_id: transaction_id.to_string(),
            },
        )
        .await;
    }

    async fn notify_workers(&self, workers: &[PostId], command: WorkerCommand) {
        for worker_id in workers {
            let topic = topics::worker_command(&self.operator, worker_id);
            if let Err(e) = self.fabric.publish(&topic, QoS::AtLeastOnce, &command).await {
                warn!(
                    "[{}] failed to notify post {worker_id} of decision: {e}",
                    self.operator
                );
            }
        }
    }

    /// One sweeper tick: drop ended COMMITTED reservations (returned so the
    /// caller can notify the vehicles) and auto-abort stale PREPARED ones.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<ActiveReservation> {
        let outcome = self.ledger.lock().sweep(now, self.prepared_ttl);

        for stale in &outcome.stale {
            warn!(
                "[{}] auto-aborting stale PREPARED reservation of {}",
                self.operator, stale.transaction_id
            );
            if let Some(worker) = &stale.assigned_worker {
                self.notify_workers(
                    std::slice::from_ref(worker),
                    WorkerCommand::Abort {
                        transaction_id: stale.transaction_id.clone(),
                    },
                )
                .await;
            }
        }

        outcome.ended
    }

    pub fn status(&self) -> CityStatus {
        let ledger = self.ledger.lock();
        CityStatus {
            enterprise: self.operator.clone(),
            managed_city: ledger.city().to_string(),
            max_posts: ledger.max_posts(),
            active_reservations: ledger.snapshot(),
        }
    }

    pub fn city_name(&self) -> String {
        self.ledger.lock().city().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, hour, min, 0).unwrap()
    }

    fn window(h1: u32, m1: u32, h2: u32, m2: u32) -> Window {
        Window::new(at(h1, m1), at(h2, m2))
    }

    fn begin(ledger: &mut CityLedger, tx: &str, w: Window) -> Result<BeginPrepare, PrepareError> {
        ledger.begin_prepare(tx, "car-1", "req-1", w, "http://op1:8080", at(9, 0))
    }

    #[test]
    fn capacity_is_enforced_across_overlapping_windows() {
        let mut ledger = CityLedger::new("Salvador", 2);
        let w = window(10, 0, 10, 30);

        assert!(begin(&mut ledger, "tx-1", w).is_ok());
        ledger.assign_worker("tx-1", "P1");
        assert!(begin(&mut ledger, "tx-2", window(10, 15, 10, 45)).is_ok());
        ledger.assign_worker("tx-2", "P2");

        match begin(&mut ledger, "tx-3", w) {
            Err(PrepareError::CapacityExceeded(_)) => {}
            other => panic!("expected capacity rejection, got {other:?}"),
        }

        // A disjoint window still fits.
        assert!(begin(&mut ledger, "tx-4", window(11, 0, 11, 30)).is_ok());
    }

    #[test]
    fn placeholder_counts_toward_capacity() {
        let mut ledger = CityLedger::new("Ilheus", 1);
        let w = window(10, 0, 10, 30);

        // Placeholder inserted, worker vote still in flight.
        assert!(begin(&mut ledger, "tx-1", w).is_ok());
        match begin(&mut ledger, "tx-2", w) {
            Err(PrepareError::CapacityExceeded(_)) => {}
            other => panic!("expected capacity rejection, got {other:?}"),
        }

        // The failed vote releases the capacity.
        ledger.cancel_pending("tx-1");
        assert!(begin(&mut ledger, "tx-2", w).is_ok());
    }

    #[test]
    fn duplicate_prepare_same_window_is_idempotent() {
        let mut ledger = CityLedger::new("Salvador", 2);
        let w = window(10, 0, 10, 30);

        assert!(matches!(
            begin(&mut ledger, "tx-1", w),
            Ok(BeginPrepare::Inserted)
        ));
        ledger.assign_worker("tx-1", "P1");
        assert!(matches!(
            begin(&mut ledger, "tx-1", w),
            Ok(BeginPrepare::AlreadyPrepared)
        ));
        assert_eq!(ledger.active().len(), 1);

        match begin(&mut ledger, "tx-1", window(12, 0, 12, 30)) {
            Err(PrepareError::Conflict(_)) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn commit_flips_and_reports_the_assigned_worker() {
        let mut ledger = CityLedger::new("Salvador", 2);
        assert!(begin(&mut ledger, "tx-1", window(10, 0, 10, 30)).is_ok());
        ledger.assign_worker("tx-1", "P2");

        assert_eq!(ledger.commit("tx-1"), vec!["P2".to_string()]);
        assert_eq!(ledger.active()[0].status, ReservationState::Committed);

        // Idempotent: nothing left to flip.
        assert!(ledger.commit("tx-1").is_empty());
        assert!(ledger.commit("tx-unknown").is_empty());
    }

    #[test]
    fn abort_removes_prepared_entries_only() {
        let mut ledger = CityLedger::new("Salvador", 2);
        assert!(begin(&mut ledger, "tx-1", window(10, 0, 10, 30)).is_ok());
        ledger.assign_worker("tx-1", "P1");
        assert!(begin(&mut ledger, "tx-2", window(11, 0, 11, 30)).is_ok());
        ledger.assign_worker("tx-2", "P1");
        ledger.commit("tx-2");

        assert_eq!(ledger.abort("tx-1"), vec!["P1".to_string()]);
        assert!(ledger.abort("tx-1").is_empty());

        let remaining: Vec<_> = ledger.active().iter().map(|r| &r.transaction_id).collect();
        assert_eq!(remaining, vec!["tx-2"]);
    }

    #[test]
    fn sweep_separates_ended_and_stale() {
        let mut ledger = CityLedger::new("Salvador", 3);

        assert!(begin(&mut ledger, "tx-done", window(8, 0, 8, 30)).is_ok());
        ledger.assign_worker("tx-done", "P1");
        ledger.commit("tx-done");

        assert!(begin(&mut ledger, "tx-stale", window(10, 0, 10, 30)).is_ok());
        ledger.assign_worker("tx-stale", "P2");

        assert!(begin(&mut ledger, "tx-live", window(10, 0, 10, 30)).is_ok());
        ledger.assign_worker("tx-live", "P3");
        ledger.commit("tx-live");

        let outcome = ledger.sweep(at(9, 10), TimeDelta::minutes(5));
        assert_eq!(outcome.ended.len(), 1);
        assert_eq!(outcome.ended[0].transaction_id, "tx-done");
        assert_eq!(outcome.stale.len(), 1);
        assert_eq!(outcome.stale[0].transaction_id, "tx-stale");

        let remaining: Vec<_> = ledger.active().iter().map(|r| &r.transaction_id).collect();
        assert_eq!(remaining, vec!["tx-live"]);
    }
}
