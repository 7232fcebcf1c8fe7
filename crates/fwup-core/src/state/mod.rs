//! State machine module.

pub mod machine;

pub use machine::{FailureKind, RetryBudget, SessionState, StateMachine};
