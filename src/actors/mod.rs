//! Background loops
//!
//! Each actor is a small `Clone` value with an async `run(self, cancel)`
//! that ticks on its own interval and returns once the token is cancelled.
//! The lifecycle spawns them under supervision, so a panic restarts the loop
//! instead of silently ending it.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  Lifecycle   │ root CancellationToken
//!                 └──────┬───────┘
//!        ┌───────────────┼────────────────┬──────────────────┐
//!        ▼               ▼                ▼                  ▼
//!  LivenessActor    StorageActor     HealthActor    NotificationManager
//!  (registry sweep) (prune + ping)   (self check)   (dispatcher)
//! ```

pub mod health;
pub mod liveness;
pub mod storage;

pub use health::HealthActor;
pub use liveness::LivenessActor;
pub use storage::StorageActor;
