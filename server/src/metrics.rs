//! Server metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "bytes_received", description = "Total bytes read from peers")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "bytes_sent", description = "Total bytes written to peers")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "accept_errors", description = "Accept failures other than transient ones")]
pub static ACCEPT_ERRORS: Counter = Counter::new();

#[metric(
    name = "fd_exhausted_rescues",
    description = "Times the reserved descriptor was used to shed a connection under EMFILE"
)]
pub static FD_EXHAUSTED_RESCUES: Counter = Counter::new();

#[metric(
    name = "idle_timeouts",
    description = "Connections shut down by the idle timeout manager"
)]
pub static IDLE_TIMEOUTS: Counter = Counter::new();
