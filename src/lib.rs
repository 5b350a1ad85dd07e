//! otagent library
//!
//! Device-side update agent: a persistent framed-JSON control connection to
//! the management server, request dispatch, and the firmware download flow.

pub mod agent;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod firmware;
pub mod fs_enum;
pub mod journal;
pub mod logger;
pub mod message;
pub mod protocol;
pub mod protocol_core;
pub mod session;
pub mod store;
pub mod transfer;
pub mod transport;
