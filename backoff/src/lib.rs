//! Retry support for transient failures when talking to external systems.
//!
//! A retry is described by two independent pieces:
//!
//! - a [`strategy`] producing the sequence of cool-off delays, and
//! - a [`RetryBudget`] bounding how long the caller is willing to keep going,
//!   either by attempt count or by a wall-clock deadline.
//!
//! The [`retry`] driver glues them to a fallible async operation and a
//! predicate deciding which errors are worth another attempt.

pub mod strategy;

mod retry;

pub use retry::{RetryBudget, retry};
