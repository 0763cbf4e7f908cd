//! Domain models.

pub mod session;
