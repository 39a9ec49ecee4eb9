//! Property tests for the charging-post state machine.
//!
//! Invariants exercised:
//! - no two non-terminal reservations on a post ever overlap
//! - PREPARE / COMMIT / ABORT are idempotent
//! - a vote is granted iff the window was free

use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use proptest::prelude::*;

use cgrid_core::post::PostState;
use cgrid_core::types::{ReservationState, Window, WorkerCommand, WorkerReply};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap()
}

/// Windows on a small grid of minutes so overlaps are frequent.
fn window_strategy() -> impl Strategy<Value = Window> {
    (0i64..240, 5i64..90).prop_map(|(start, len)| {
        Window::new(
            base_time() + TimeDelta::minutes(start),
            base_time() + TimeDelta::minutes(start + len),
        )
    })
}

#[derive(Debug, Clone)]
enum Op {
    Prepare { tx: u8, window: Window },
    Commit { tx: u8 },
    Abort { tx: u8 },
    Sweep { minutes: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12, window_strategy()).prop_map(|(tx, window)| Op::Prepare { tx, window }),
        (0u8..12).prop_map(|tx| Op::Commit { tx }),
        (0u8..12).prop_map(|tx| Op::Abort { tx }),
        (0i64..400).prop_map(|minutes| Op::Sweep { minutes }),
    ]
}

fn tx_id(tx: u8) -> String {
    format!("tx-{tx}")
}

fn apply(post: &mut PostState, op: &Op, now: DateTime<Utc>) {
    match op {
        Op::Prepare { tx, window } => {
            post.handle_command(
                WorkerCommand::PrepareReserveWindow {
                    window: *window,
                    transaction_id: tx_id(*tx),
                },
                now,
            );
        }
        Op::Commit { tx } => {
            post.handle_command(
                WorkerCommand::Commit {
                    transaction_id: tx_id(*tx),
                },
                now,
            );
        }
        Op::Abort { tx } => {
            post.handle_command(
                WorkerCommand::Abort {
                    transaction_id: tx_id(*tx),
                },
                now,
            );
        }
        Op::Sweep { minutes } => {
            post.sweep(
                base_time() + TimeDelta::minutes(*minutes),
                TimeDelta::minutes(5),
                20.0,
            );
        }
    }
}

fn assert_no_blocking_overlap(post: &PostState) -> Result<(), TestCaseError> {
    let blocking: Vec<_> = post
        .reservations()
        .iter()
        .filter(|r| r.status.blocks())
        .collect();

    for (i, a) in blocking.iter().enumerate() {
        for b in blocking.iter().skip(i + 1) {
            prop_assert!(
                !a.window.overlaps(&b.window),
                "overlapping non-terminal entries: {:?} and {:?}",
                a,
                b
            );
        }
    }
    Ok(())
}

proptest! {
    /// No sequence of commands ever leaves two non-terminal reservations
    /// with overlapping windows on the same post.
    #[test]
    fn no_overlap_survives_any_command_sequence(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let mut post = PostState::new("P1");
        let now = base_time();

        for op in &ops {
            apply(&mut post, op, now);
            assert_no_blocking_overlap(&post)?;
        }
    }

    /// Applying any command twice is equivalent to applying it once.
    #[test]
    fn commands_are_idempotent(
        ops in prop::collection::vec(op_strategy(), 0..20),
        window in window_strategy(),
        tx in 0u8..12,
    ) {
        let now = base_time();

        let mut once = PostState::new("P1");
        let mut twice = PostState::new("P1");
        for op in &ops {
            apply(&mut once, op, now);
            apply(&mut twice, op, now);
        }

        for command in [
            WorkerCommand::PrepareReserveWindow {
                window,
                transaction_id: tx_id(tx),
            },
            WorkerCommand::Commit { transaction_id: tx_id(tx) },
            WorkerCommand::Abort { transaction_id: tx_id(tx) },
        ] {
            once.handle_command(command.clone(), now);
            twice.handle_command(command.clone(), now);
            twice.handle_command(command, now);

            prop_assert_eq!(once.reservations().len(), twice.reservations().len());
            for (a, b) in once.reservations().iter().zip(twice.reservations()) {
                prop_assert_eq!(&a.transaction_id, &b.transaction_id);
                prop_assert_eq!(a.status, b.status);
                prop_assert_eq!(a.window, b.window);
            }
        }
    }

    /// A PREPARE vote is granted iff the window was available, and a granted
    /// vote makes the window unavailable.
    #[test]
    fn vote_matches_availability(
        ops in prop::collection::vec(op_strategy(), 0..40),
        window in window_strategy(),
    ) {
        let now = base_time();
        let mut post = PostState::new("P1");
        for op in &ops {
            apply(&mut post, op, now);
        }

        let free_before = post.is_available(&window);
        let reply = post.handle_command(
            WorkerCommand::PrepareReserveWindow {
                window,
                transaction_id: "tx-probe".to_string(),
            },
            now,
        );

        match reply {
            Some(WorkerReply::Prepare { success, .. }) => {
                prop_assert_eq!(success, free_before);
                if success {
                    prop_assert!(!post.is_available(&window));
                    let found = post.reservations().iter().any(|r| {
                        r.transaction_id == "tx-probe"
                            && r.status == ReservationState::Prepared
                    });
                    prop_assert!(found);
                }
            }
            other => prop_assert!(false, "expected prepare reply, got {:?}", other),
        }
    }
}
