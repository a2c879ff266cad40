//! Enrollment and touch scheduling: walks each enrolled customer through a
//! campaign's touches and owns the claim-and-process batch loop.

#![warn(clippy::unwrap_used)]

pub mod alerts;
pub mod batch;
pub mod claimer;
pub mod conflict;
pub mod engine;
pub mod enroller;
pub mod executor;
pub mod lifecycle;
pub mod retry;
pub mod state_machine;
pub mod store;

pub use alerts::{Alert, AlertCenter, AlertKind, AlertStatus};
pub use batch::{BatchRunner, BatchSummary, TouchResults};
pub use claimer::{Advance, ClaimedTouch, TouchClaimer, TouchOutcome};
pub use conflict::{ConflictResolver, JobOutcome, ResolveAction, SweepReport};
pub use engine::{ConflictSweepSummary, SequencerEngine};
pub use enroller::Enroller;
pub use executor::{SendExecutor, SendResult};
pub use lifecycle::{LifecycleManager, LifecycleReport};
pub use retry::{EnqueueOutcome, RetryItemOutcome, RetryQueue, RetryReport};
pub use state_machine::EnrollmentStateMachine;
pub use store::EngineStore;
