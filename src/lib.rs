//! Multi-client SSH chat server.
//!
//! Connections are accepted up to a configured ceiling, authenticated with a
//! trust-on-first-use public key policy, and then run an interactive line
//! session whose lines are fanned out to every other live session.

pub mod auth;
pub mod chat;
pub mod cli;
pub mod config;
pub mod context;
pub mod logging;
pub mod pool;
pub mod server;
pub mod ssh;
pub mod utils;
