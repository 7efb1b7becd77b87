//! Offline-first writes for a habit-tracking client.
//!
//! Writes are shown in the read cache immediately, stored in a durable
//! queue, and reconciled with the remote service when connectivity allows.

pub mod cache;
pub mod connectivity;
pub mod error;
pub mod habit;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
