//! Daemon and client protocol (C4)
//!
//! The daemon multiplexes agents, owns their records, supervises session
//! child processes, and persists the registry across restarts. Clients
//! attach over a Unix socket with length-prefixed JSON frames.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::DaemonClient;
pub use protocol::{Event, Request, ResolveArgs, Response, StartArgs};
pub use registry::Registry;
pub use server::{Daemon, DaemonConfig};
