//! Quorum arbiter daemons.
//!
//! Two programs share this crate and the [`arbiter_proto`] wire protocol:
//! the arbiter server (`arbiterd`), a single well-known daemon that
//! tracks per-client state for many clusters and decides which clients
//! keep their vote after a split, and the per-node agent
//! (`arbiter-agent`), which publishes the local cluster view, receives
//! the vote and asserts it to the local quorum subsystem.

pub(crate) mod algo;
pub mod client;
pub mod config;
pub mod error;
pub mod heuristics;
pub mod runtime;
pub mod send_queue;
pub mod server;
pub mod timer;
pub mod tls;

pub use client::{Agent, AgentError};
pub use config::{AgentConfig, ServerSettings};
pub use error::DisconnectReason;
pub use server::{BoundServer, Server};
