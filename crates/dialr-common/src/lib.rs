//! Dialr Common - Shared types and configuration
//!
//! This crate provides the domain types exchanged between the durable
//! stores and the resolution engine, the clock abstraction, and the root
//! service configuration.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use types::*;
