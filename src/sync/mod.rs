//! Offline synchronization: the request interceptor, the outbox of pending
//! writes and the sweep that replays them.

mod interceptor;
mod outbox;
mod sweep;

pub use interceptor::{decode, Interceptor};
pub use outbox::{Mutation, Outbox, PendingMutation, TempIds};
pub use sweep::{ReplayOutcome, SweepReport};
