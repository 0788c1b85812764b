//! procpool - an application process pool.
//!
//! A long-lived supervisor that owns worker processes for any number of web
//! applications, hands out request sessions over a local socket, and
//! reclaims idle resources in the background.
//!
//! Frontends talk to the [`server::Server`] through [`client::PoolClient`];
//! the answer to a `get` is a file descriptor that is a direct duplex pipe
//! to the chosen worker. In-process embedders can use [`pool::Pool`]
//! directly.

pub mod auth;
pub mod channel;
pub mod cli;
pub mod client;
pub mod error;
pub mod logging;
pub mod options;
pub mod pool;
pub mod server;
pub mod spawn;

pub use error::{PoolError, Result};
pub use options::PoolOptions;
pub use pool::{Pool, PoolConfig, Session};
