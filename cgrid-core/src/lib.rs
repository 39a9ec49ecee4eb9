//! # cgrid Core Library
//!
//! Shared building blocks for the cgrid charging-reservation network: the
//! wire-level data model, the MQTT message fabric, the service-registry
//! client and the charging-post state machine.
//!
//! ## Architecture
//!
//! ```text
//! Vehicle                      Operator (one per city)
//!   │  MQTT pub/sub              │
//!   ▼                            ▼
//! ┌──────────────┐   HTTP    ┌──────────────┐
//! │ cgrid-operator│◄────────►│ cgrid-operator│   remote 2PC participants
//! │  coordinator  │  /2pc/*  │  participant  │
//! └──────┬───────┘           └──────────────┘
//!        │ MQTT QoS 1 (command / response)
//!        ▼
//! ┌──────────────┐
//! │ cgrid-worker  │   one process per charging post
//! └──────────────┘
//! ```
//!
//! A vehicle asks any operator for route options, then publishes its chosen
//! route on `car/route/<operator>`. The receiving operator becomes the
//! two-phase-commit coordinator for that transaction only: it prepares one
//! post per city along the route (locally over MQTT, remotely over HTTP),
//! commits or aborts everywhere, and publishes the final status on
//! `car/reservation/status/<vehicle>`.

pub mod config;
pub mod error;
pub mod fabric;
pub mod post;
pub mod registry;
pub mod types;

pub use config::{OperatorConfig, PlannerConfig, WorkerConfig};
pub use error::{CgridError, CgridResult};
pub use fabric::{Fabric, InboundMessage, Subscription};
pub use post::{IntervalReservation, PostState};
pub use registry::RegistryClient;
pub use types::*;
