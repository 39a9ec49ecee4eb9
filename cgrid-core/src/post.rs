//! Charging-post state machine.
//!
//! Owns the finest-grained reservation data: the interval list of one post.
//! Pure state transitions live here; `cgrid-worker` wraps them with the MQTT
//! command loop and a single mutex, so all operations on one post are
//! linearizable.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::types::{PostId, ReservationState, TxId, Window, WorkerCommand, WorkerEvent, WorkerReply};

/// One entry in a post's interval reservation list.
#[derive(Debug, Clone)]
pub struct IntervalReservation {
    pub window: Window,
    pub transaction_id: TxId,
    pub status: ReservationState,
    pub prepared_at: DateTime<Utc>,
}

/// Reservation state of one charging post.
#[derive(Debug)]
pub struct PostState {
    id: PostId,
    reservations: Vec<IntervalReservation>,
}

impl PostState {
    pub fn new(id: impl Into<PostId>) -> Self {
        Self {
            id: id.into(),
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reservations(&self) -> &[IntervalReservation] {
        &self.reservations
    }

    /// A window is available iff no non-terminal entry overlaps it.
    pub fn is_available(&self, window: &Window) -> bool {
        self.reservations
            .iter()
            .all(|r| !r.status.blocks() || !r.window.overlaps(window))
    }

    /// Apply one command; returns the reply to publish, if the command has
    /// one. COMMIT and ABORT are acknowledged implicitly by idempotence.
    pub fn handle_command(&mut self, command: WorkerCommand, now: DateTime<Utc>) -> Option<WorkerReply> {
        match command {
            WorkerCommand::QueryAvailability { window } => Some(WorkerReply::Availability {
                available: self.is_available(&window),
                window,
                worker_id: self.id.clone(),
            }),

            WorkerCommand::PrepareReserveWindow {
                window,
                transaction_id,
            } => {
                let success = self.prepare(window, transaction_id.clone(), now);
                Some(WorkerReply::Prepare {
                    success,
                    transaction_id,
                    worker_id: self.id.clone(),
                })
            }

            WorkerCommand::Commit { transaction_id } => {
                self.decide(&transaction_id, ReservationState::Committed);
                None
            }

            WorkerCommand::Abort { transaction_id } => {
                self.decide(&transaction_id, ReservationState::Aborted);
                None
            }
        }
    }

    /// PREPARE vote. Idempotent: a second PREPARE for the same
    /// `(transaction_id, window)` already in PREPARED succeeds without
    /// creating a second entry.
    fn prepare(&mut self, window: Window, transaction_id: TxId, now: DateTime<Utc>) -> bool {
        if !window.is_valid() {
            warn!("post {}: rejecting invalid window in PREPARE", self.id);
            return false;
        }

        if self.reservations.iter().any(|r| {
            r.transaction_id == transaction_id
                && r.window == window
                && r.status == ReservationState::Prepared
        }) {
            debug!("post {}: duplicate PREPARE for {transaction_id}, already held", self.id);
            return true;
        }

        if !self.is_available(&window) {
            return false;
        }

        self.reservations.push(IntervalReservation {
            window,
            transaction_id: transaction_id.clone(),
            status: ReservationState::Prepared,
            prepared_at: now,
        });
        info!("post {}: PREPARED window for {transaction_id}", self.id);
        true
    }

    /// Flip every PREPARED entry of the transaction to the decided state.
    /// Unknown transactions are a no-op: the decision was already enacted.
    fn decide(&mut self, transaction_id: &str, decision: ReservationState) {
        let mut flipped = 0;
        for r in &mut self.reservations {
            if r.transaction_id == transaction_id && r.status == ReservationState::Prepared {
                r.status = decision;
                flipped += 1;
            }
        }
        if flipped > 0 {
            info!("post {}: {decision:?} for {transaction_id}", self.id);
        } else {
            debug!("post {}: {decision:?} for unknown {transaction_id}, no-op", self.id);
        }
    }

    /// Time-passage sweep.
    ///
    /// COMMITTED entries whose window has ended become CHARGED and yield a
    /// charged notice. PREPARED entries older than `prepared_ttl` are
    /// auto-aborted: their coordinator's decision never arrived.
    pub fn sweep(
        &mut self,
        now: DateTime<Utc>,
        prepared_ttl: TimeDelta,
        charge_cost: f64,
    ) -> Vec<WorkerEvent> {
        let mut events = Vec::new();

        for r in &mut self.reservations {
            match r.status {
                ReservationState::Committed if r.window.ended_by(now) => {
                    r.status = ReservationState::Charged;
                    events.push(WorkerEvent::PassedAndCharged {
                        transaction_id: r.transaction_id.clone(),
                        cost: charge_cost,
                        window: r.window,
                        worker_id: self.id.clone(),
                    });
                    info!("post {}: charged {}", self.id, r.transaction_id);
                }
                ReservationState::Prepared if now - r.prepared_at >= prepared_ttl => {
                    r.status = ReservationState::Aborted;
                    warn!(
                        "post {}: auto-aborting stale PREPARED entry of {}",
                        self.id, r.transaction_id
                    );
                }
                _ => {}
            }
        }

        events
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

    fn prepare(post: &mut PostState, tx: &str, w: Window) -> bool {
        match post.handle_command(
            WorkerCommand::PrepareReserveWindow {
                window: w,
                transaction_id: tx.to_string(),
            },
            at(9, 0),
        ) {
            Some(WorkerReply::Prepare { success, .. }) => success,
            other => panic!("expected prepare reply, got {other:?}"),
        }
    }

    #[test]
    fn prepare_blocks_overlapping_windows() {
        let mut post = PostState::new("P1");
        assert!(prepare(&mut post, "tx-1", window(10, 0, 10, 30)));
        assert!(!prepare(&mut post, "tx-2", window(10, 15, 10, 45)));
        // Adjacent windows are fine: intervals are half-open.
        assert!(prepare(&mut post, "tx-3", window(10, 30, 11, 0)));
    }

    #[test]
    fn duplicate_prepare_is_idempotent() {
        let mut post = PostState::new("P1");
        let w = window(10, 0, 10, 30);
        assert!(prepare(&mut post, "tx-1", w));
        assert!(prepare(&mut post, "tx-1", w));
        assert_eq!(post.reservations().len(), 1);

        // A later COMMIT still yields exactly one COMMITTED entry.
        post.handle_command(
            WorkerCommand::Commit {
                transaction_id: "tx-1".to_string(),
            },
            at(9, 1),
        );
        let committed: Vec<_> = post
            .reservations()
            .iter()
            .filter(|r| r.status == ReservationState::Committed)
            .collect();
        assert_eq!(committed.len(), 1);
    }

    #[test]
    fn prepare_then_abort_frees_the_window() {
        let mut post = PostState::new("P1");
        let w = window(10, 0, 10, 30);
        assert!(prepare(&mut post, "tx-1", w));
        post.handle_command(
            WorkerCommand::Abort {
                transaction_id: "tx-1".to_string(),
            },
            at(9, 1),
        );
        assert!(post
            .reservations()
            .iter()
            .all(|r| r.transaction_id != "tx-1" || r.status.is_terminal()));
        assert!(prepare(&mut post, "tx-2", w));
    }

    #[test]
    fn decisions_are_idempotent_and_ignore_unknown_transactions() {
        let mut post = PostState::new("P1");
        assert!(prepare(&mut post, "tx-1", window(10, 0, 10, 30)));

        for _ in 0..2 {
            post.handle_command(
                WorkerCommand::Commit {
                    transaction_id: "tx-1".to_string(),
                },
                at(9, 1),
            );
        }
        post.handle_command(
            WorkerCommand::Commit {
                transaction_id: "tx-unknown".to_string(),
            },
            at(9, 1),
        );

        assert_eq!(post.reservations().len(), 1);
        assert_eq!(post.reservations()[0].status, ReservationState::Committed);

        // ABORT after COMMIT does not undo the decision.
        post.handle_command(
            WorkerCommand::Abort {
                transaction_id: "tx-1".to_string(),
            },
            at(9, 2),
        );
        assert_eq!(post.reservations()[0].status, ReservationState::Committed);
    }

    #[test]
    fn sweep_charges_ended_committed_entries() {
        let mut post = PostState::new("P1");
        assert!(prepare(&mut post, "tx-1", window(10, 0, 10, 30)));
        post.handle_command(
            WorkerCommand::Commit {
                transaction_id: "tx-1".to_string(),
            },
            at(9, 1),
        );

        // Nothing happens while the window is still running.
        assert!(post
            .sweep(at(10, 15), TimeDelta::minutes(5), 20.0)
            .is_empty());

        let events = post.sweep(at(10, 30), TimeDelta::minutes(5), 20.0);
        assert_eq!(events.len(), 1);
        match &events[0] {
            WorkerEvent::PassedAndCharged {
                transaction_id,
                cost,
                worker_id,
                ..
            } => {
                assert_eq!(transaction_id, "tx-1");
                assert_eq!(*cost, 20.0);
                assert_eq!(worker_id, "P1");
            }
        }
        assert_eq!(post.reservations()[0].status, ReservationState::Charged);

        // A second sweep emits nothing.
        assert!(post
            .sweep(at(10, 40), TimeDelta::minutes(5), 20.0)
            .is_empty());
    }

    #[test]
    fn sweep_auto_aborts_stale_prepared_entries() {
        let mut post = PostState::new("P1");
        let w = window(10, 0, 10, 30);
        assert!(prepare(&mut post, "tx-1", w));

        post.sweep(at(9, 4), TimeDelta::minutes(5), 20.0);
        assert_eq!(post.reservations()[0].status, ReservationState::Prepared);

        post.sweep(at(9, 5), TimeDelta::minutes(5), 20.0);
        assert_eq!(post.reservations()[0].status, ReservationState::Aborted);
        assert!(prepare(&mut post, "tx-2", w));
    }

    #[test]
    fn availability_query_reflects_state() {
        let mut post = PostState::new("P1");
        let w = window(10, 0, 10, 30);
        assert!(prepare(&mut post, "tx-1", w));

        let reply = post.handle_command(WorkerCommand::QueryAvailability { window: w }, at(9, 0));
        match reply {
            Some(WorkerReply::Availability { available, .. }) => assert!(!available),
            other => panic!("expected availability reply, got {other:?}"),
        }
    }
}
