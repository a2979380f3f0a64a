//! Core runtime metrics.
//!
//! Counters for connection lifecycle, transferred bytes, and timers.
//! Exposed through the `metriken` registry so a consumer can scrape them
//! however it likes.

use metriken::{Counter, metric};

#[metric(
    name = "hopline/connections/accepted",
    description = "Total connections accepted by TCP servers"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "hopline/connections/connected",
    description = "Total outbound connections established"
)]
pub static CONNECTIONS_CONNECTED: Counter = Counter::new();

#[metric(
    name = "hopline/connections/connect_failures",
    description = "Total outbound connection attempts that failed"
)]
pub static CONNECT_FAILURES: Counter = Counter::new();

#[metric(
    name = "hopline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "hopline/bytes/received",
    description = "Total bytes received on connections"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "hopline/bytes/sent",
    description = "Total bytes written to connections"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "hopline/timers/scheduled",
    description = "Total timers scheduled"
)]
pub static TIMERS_SCHEDULED: Counter = Counter::new();

#[metric(name = "hopline/timers/fired", description = "Total timers fired")]
pub static TIMERS_FIRED: Counter = Counter::new();

#[metric(
    name = "hopline/timers/cancelled",
    description = "Total timers cancelled before firing"
)]
pub static TIMERS_CANCELLED: Counter = Counter::new();
