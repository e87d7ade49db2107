//! chartfleet staged rollouts — batch ordering, step sizing, readiness gates.
//!
//! This crate decides, for one pass of the deployment controller, which
//! clusters receive or refresh their release. A rollout episode walks the
//! candidate clusters in a fixed order, one batch at a time, and only moves
//! to the next batch once every release of the episode reports ready.
//!
//! # Components
//!
//! - **`strategy`** — Phase selection and step-size resolution (cap rule)
//! - **`batch`** — Per-candidate release state and the readiness gate
//! - **`controller`** — Planner turning progress and batch state into a plan

pub mod batch;
pub mod controller;
pub mod error;
pub mod strategy;

pub use batch::{BatchEntry, BatchMetadata, ReleaseState, RolloutGate};
pub use controller::{RolloutDecision, RolloutPlan, RolloutPlanner};
pub use error::{RolloutError, RolloutResult};
pub use strategy::{ResolvedSteps, RolloutPhase, active_phase, scaled_value};
