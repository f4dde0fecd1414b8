// Lockbox — Rotation Module
//
// Re-wraps credentials referencing a superseded key id under the newly
// active key. Runs are persisted, checkpointed by last-processed row,
// and resumable after cancellation or crash. Rotation contends with
// ordinary writers only per-row, through the same conditional-commit
// mechanism, never a global lock.

mod coordinator;
mod error;

pub use coordinator::{RotationCoordinator, RotationRun, RunOutcome, RunState, StepOutcome};
pub use error::RotationError;
