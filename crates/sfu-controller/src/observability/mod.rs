//! Observability for the SFU Controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Room ids appear in logs and spans but never as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms with at least one peer |
//! | `sfu_peers_active` | Gauge | none | Joined peers across rooms |
//! | `sfu_connections_active` | Gauge | none | Open signaling connections |
//! | `sfu_routers_active` | Gauge | none | Routers allocated on workers |
//! | `sfu_workers_alive` | Gauge | none | Live media workers |
//! | `sfu_requests_total` | Counter | `method`, `outcome` | Signaling requests |
//! | `sfu_request_duration_seconds` | Histogram | `method` | Request latency |
//! | `sfu_peers_removed_total` | Counter | `reason` | Peer departures |
//! | `sfu_worker_deaths_total` | Counter | none | Fatal worker failures |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, ReadinessPhase};
pub use metrics::init_metrics_recorder;
