//! HTTP engine metrics.

use metriken::{Counter, metric};

#[metric(
    name = "hopline_http/client/exchanges",
    description = "Client exchanges started"
)]
pub static CLIENT_EXCHANGES: Counter = Counter::new();

#[metric(
    name = "hopline_http/client/retries",
    description = "Automatic retries of idempotent requests"
)]
pub static CLIENT_RETRIES: Counter = Counter::new();

#[metric(
    name = "hopline_http/client/errors",
    description = "Client exchanges that ended in an error event"
)]
pub static CLIENT_ERRORS: Counter = Counter::new();

#[metric(
    name = "hopline_http/pool/checkouts",
    description = "Idle connections checked out of the pool"
)]
pub static POOL_CHECKOUTS: Counter = Counter::new();

#[metric(
    name = "hopline_http/pool/checkins",
    description = "Connections returned to the pool"
)]
pub static POOL_CHECKINS: Counter = Counter::new();

#[metric(
    name = "hopline_http/pool/expirations",
    description = "Pooled connections closed by the idle timer"
)]
pub static POOL_EXPIRATIONS: Counter = Counter::new();

#[metric(
    name = "hopline_http/pool/evictions",
    description = "Pooled connections evicted (peer close or unsolicited data)"
)]
pub static POOL_EVICTIONS: Counter = Counter::new();

#[metric(
    name = "hopline_http/server/exchanges",
    description = "Server exchanges surfaced"
)]
pub static SERVER_EXCHANGES: Counter = Counter::new();

#[metric(
    name = "hopline_http/protocol_errors",
    description = "Messages aborted by a protocol error"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();
