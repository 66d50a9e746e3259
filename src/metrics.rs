//! evline runtime metrics.
//!
//! Static counters for connection lifecycle, byte totals, TLS activity, and
//! thread-pool throughput. Exposed through the `metriken` registry.

use metriken::{metric, Counter, Gauge};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "evline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "evline/connections/opened",
    description = "Total outbound connections that reached open"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "evline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();

#[metric(
    name = "evline/connections/active",
    description = "Currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "evline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "evline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

// ── TLS ──────────────────────────────────────────────────────────

#[metric(
    name = "evline/tls/handshakes",
    description = "TLS handshakes completed"
)]
pub static TLS_HANDSHAKES: Counter = Counter::new();

// ── Timers ───────────────────────────────────────────────────────

#[metric(
    name = "evline/socket/timeouts",
    description = "Inactivity timeouts fired"
)]
pub static SOCKET_TIMEOUTS: Counter = Counter::new();

// ── Accept path ──────────────────────────────────────────────────

#[metric(
    name = "evline/accept/backoffs",
    description = "Accept backoffs after fd exhaustion"
)]
pub static ACCEPT_BACKOFFS: Counter = Counter::new();

// ── Thread pool ──────────────────────────────────────────────────

#[metric(
    name = "evline/pool/tasks",
    description = "Blocking tasks executed by the thread pool"
)]
pub static POOL_TASKS: Counter = Counter::new();
