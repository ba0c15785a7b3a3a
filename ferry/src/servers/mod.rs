//! Upstream servers: the model, the pool with health-aware selection, and
//! the dialers that turn a chosen server into a live connection.

mod dialer;
mod pool;
mod server;

pub use dialer::dial;
pub use pool::{Group, HealthRegistry, PROBE_INTERVAL, SelectPolicy, ServerHealth, ServerPool};
pub use server::{DIRECT_NAME, REJECT_NAME, Server, ServerKind};
