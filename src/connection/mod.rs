//! Connection management for a single point-to-point serial link
//!
//! This module handles:
//! - The listener, dialer and session roles
//! - Serialized state transitions with at most one live role
//! - Automatic return to listening after a session ends or a dial fails

mod manager;
mod roles;
mod session;

pub use manager::{ConnectionConfig, ConnectionManager, LinkEvent, LinkHandle};
