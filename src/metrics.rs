//! Routing core metrics.

use metriken::{Counter, Gauge, metric};

/// Requests enqueued on a backend connection.
#[metric(name = "shardmux_requests_forwarded")]
pub static REQUESTS_FORWARDED: Counter = Counter::new();

/// Requests failed by faults, timeouts, or teardown.
#[metric(name = "shardmux_requests_failed")]
pub static REQUESTS_FAILED: Counter = Counter::new();

/// Responses completed on backend connections.
#[metric(name = "shardmux_responses_received")]
pub static RESPONSES_RECEIVED: Counter = Counter::new();

/// Lookups refused because the owning server was dead.
#[metric(name = "shardmux_no_server_errors")]
pub static NO_SERVER_ERRORS: Counter = Counter::new();

/// Servers ejected from the distribution.
#[metric(name = "shardmux_server_ejections")]
pub static SERVER_EJECTIONS: Counter = Counter::new();

/// Probe requests admitted to ejected servers.
#[metric(name = "shardmux_server_probes")]
pub static SERVER_PROBES: Counter = Counter::new();

/// Ejected servers returned to the distribution.
#[metric(name = "shardmux_server_revivals")]
pub static SERVER_REVIVALS: Counter = Counter::new();

/// Backend connection faults.
#[metric(name = "shardmux_server_faults")]
pub static SERVER_FAULTS: Counter = Counter::new();

/// Requests failed on the pool timeout.
#[metric(name = "shardmux_request_timeouts")]
pub static REQUEST_TIMEOUTS: Counter = Counter::new();

/// Continuum rebuilds across all pools.
#[metric(name = "shardmux_continuum_rebuilds")]
pub static CONTINUUM_REBUILDS: Counter = Counter::new();

/// Replacement pool sets staged.
#[metric(name = "shardmux_pool_reloads")]
pub static POOL_RELOADS: Counter = Counter::new();

/// Staged pools promoted to active.
#[metric(name = "shardmux_pool_promotions")]
pub static POOL_PROMOTIONS: Counter = Counter::new();

/// Open client connections.
#[metric(name = "shardmux_client_connections")]
pub static CLIENT_CONNECTIONS: Gauge = Gauge::new();

/// Open backend connections.
#[metric(name = "shardmux_server_connections")]
pub static SERVER_CONNECTIONS: Gauge = Gauge::new();
