//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket session through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: loaded once at startup, read-only afterwards
//! - **hub**: the connection hub (rooms, connections, rejected codes) behind one mutex
//! - **durable**: availability-gated handle to the durable room store
//! - **router**: message router bound to the transcription and translation services
//! - **streaming**: factory for per-connection streaming transcription sessions
//! - **metrics**: per-endpoint request counters filled in by middleware
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! Every field is either `Arc`-backed or cheap to clone, so cloning `AppState` into each
//! actix worker (and each WebSocket actor) shares the same underlying state.
//!
//! ### RwLock for metrics
//! Many requests update metrics concurrently; the write lock is held only for a few
//! integer additions. A poisoned lock is recovered rather than propagated, since
//! counters are still meaningful after a panic elsewhere.

use crate::config::AppConfig;
use crate::hub::{Hub, RoomPolicy, SharedHub};
use crate::rooms::DurableRooms;
use crate::router::Router;
use crate::services::{StreamingTranscriber, Transcriber, Translator};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub hub: SharedHub,
    pub durable: DurableRooms,
    pub router: Router,
    pub streaming: Arc<dyn StreamingTranscriber>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Request and connection counters collected since startup.
///
/// ## Fields:
/// - **request_count** / **error_count**: all HTTP requests and the ones that failed
/// - **active_connections**: WebSocket sessions currently open
/// - **total_connections**: WebSocket sessions opened since startup
/// - **endpoint_metrics**: per-route statistics keyed by `"METHOD /route/pattern"`
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_connections: u32,
    pub total_connections: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for one route.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Total time spent processing all requests to this route (milliseconds)
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire the hub, router and services together.
    ///
    /// ## What this does:
    /// 1. Builds the hub from the room, heartbeat and rejected-code settings
    /// 2. Binds a router to the hub and the two batch collaborators
    /// 3. Starts empty metrics and records the start time
    pub fn new(
        config: AppConfig,
        durable: DurableRooms,
        transcriber: Arc<dyn Transcriber>,
        translator: Arc<dyn Translator>,
        streaming: Arc<dyn StreamingTranscriber>,
    ) -> Self {
        let hub = SharedHub::new(Hub::new(
            RoomPolicy::new(&config.rooms, config.heartbeat.interval()),
            config.rooms.transcript_limit,
            config.rejected_codes.max_entries,
            durable.clone(),
        ));
        let router = Router::new(
            hub.clone(),
            transcriber,
            translator,
            config.services.baseline_language.clone(),
        );

        Self {
            config: Arc::new(config),
            hub,
            durable,
            router,
            streaming,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    /// Increment the total error counter (4xx/5xx responses and handler errors).
    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against `endpoint`.
    ///
    /// The first time an endpoint is seen, `.entry().or_default()` creates its zeroed
    /// metric; later requests update it in place.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn connection_opened(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_connections += 1;
        metrics.total_connections += 1;
    }

    /// Saturates at zero rather than underflowing.
    pub fn connection_closed(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Copy of the current metrics, so the lock is not held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average = total duration ÷ requests (0.0 before the first request).
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Errors ÷ requests, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
