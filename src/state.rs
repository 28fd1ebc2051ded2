//! # Application State
//!
//! Shared state handed to every HTTP handler and monitor socket.
//!
//! ## What's Shared:
//! - **config**: the live configuration, updated through `PUT /api/v1/config`
//! - **manager**: the one voice session this process runs
//! - **persistence**: snapshot file, when `session.snapshot_path` is set
//! - **metrics**: HTTP request counters and the number of attached monitors
//!
//! ## Thread Safety:
//! actix-web runs one handler set per worker thread, so everything here is behind `Arc`.
//! The manager is already a cheap `Arc` handle; config and metrics use `RwLock` and recover
//! from poisoning instead of panicking.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use voice_session::config::AppConfig;
use voice_session::persistence::SessionPersistence;
use voice_session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub manager: SessionManager,
    pub persistence: Option<Arc<SessionPersistence>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Monitor sockets currently attached.
    pub monitor_clients: u32,
    /// Keyed by `"METHOD /route/pattern"`.
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    pub fn new(config: AppConfig, manager: SessionManager, persistence: Option<Arc<SessionPersistence>>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            manager,
            persistence,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Apply a partial JSON update; the stored config is only replaced if it validates.
    pub fn update_config(&self, json_str: &str) -> anyhow::Result<AppConfig> {
        let mut config = write(&self.config);
        let mut updated = config.clone();
        updated.update_from_json(json_str)?;
        *config = updated.clone();
        Ok(updated)
    }

    /// Called by the request metrics middleware once per request.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn monitor_attached(&self) {
        write(&self.metrics).monitor_clients += 1;
    }

    pub fn monitor_detached(&self) {
        let mut metrics = write(&self.metrics);
        metrics.monitor_clients = metrics.monitor_clients.saturating_sub(1);
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
