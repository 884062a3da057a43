//! Domain model module declarations.

pub mod agent;
pub mod lifecycle;
pub mod session;
