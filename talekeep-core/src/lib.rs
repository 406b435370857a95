//! Operations core for the Talekeep audiobook server.
//!
//! Everything long-running flows through one pipeline: a request enqueues an
//! [`queue::OperationQueue`] entry, a worker executes the operation body with
//! a per-operation [`queue::ProgressReporter`], the reporter dual-writes
//! progress to the [`store::Store`] and fans events out through the
//! [`events::EventHub`], and subscribed clients observe the stream live.
//! The [`cache::SizeCache`] memoizes the filesystem aggregates the status
//! surface reports.
//!
//! Collaborators are injected explicitly; nothing in this crate requires a
//! process-wide singleton.

pub mod cache;
pub mod error;
pub mod events;
pub mod hashing;
pub mod media;
pub mod ops;
pub mod queue;
pub mod scheduler;
pub mod secrets;
pub mod store;

pub use error::{CoreError, Result};
