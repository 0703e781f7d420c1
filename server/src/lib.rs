//! Reactor-pattern TCP server framework.
//!
//! A [`TcpServer`] accepts connections on a base event loop, dispatches each
//! one to a worker loop round-robin, and delivers inbound bytes to
//! user-provided callbacks while buffering and asynchronously draining
//! outbound bytes. Idle connections are tracked by a time-bucket wheel and
//! shut down after a configurable quiet period.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod error;
pub mod idle;
pub mod logging;
pub mod loop_pool;
pub mod metrics;
pub mod server;
pub mod timer;

pub use config::Config;
pub use connection::TcpConnection;
pub use error::ServerError;
pub use server::TcpServer;
