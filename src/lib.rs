#![forbid(unsafe_code)]

//! Supervision of a local Azurite storage emulator session.
//!
//! A [`SessionManager`] starts, stops and cleans a single emulator process,
//! tracks whether it is running, and publishes started/stopped events to
//! any number of observers.

pub mod config;
pub mod errors;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod process;

pub use config::AzuriteConfig;
pub use errors::{AppError, Result};
pub use orchestrator::SessionManager;
