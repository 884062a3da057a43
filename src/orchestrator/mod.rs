//! Session orchestration.
//!
//! Covers the session store, the injected hooks, and the lifecycle manager
//! that ties them to agent clients.

pub mod hooks;
pub mod manager;
pub mod store;
