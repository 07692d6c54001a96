//! Health-check handler.

use super::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub build_time: String,
    pub staging_writes: bool,
    pub active_locks: usize,
    pub peak_rss_bytes: u64,
}

/// Return the process-lifetime peak RSS (high-water mark) in bytes.
/// Uses `getrusage(RUSAGE_SELF)` which captures even microsecond-lived allocations.
pub fn get_peak_rss_bytes() -> u64 {
    // SAFETY: `libc::getrusage` writes into a caller-provided, zero-initialised
    // `rusage` on the stack; RUSAGE_SELF cannot fail for the calling process.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
            let ru_maxrss = usage.ru_maxrss as u64;
            // macOS reports ru_maxrss in bytes; Linux reports in KB
            if cfg!(target_os = "macos") {
                ru_maxrss
            } else {
                ru_maxrss * 1024
            }
        } else {
            0
        }
    }
}

/// Health check handler
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build_time: env!("WDI_BUILD_TIME").to_string(),
        staging_writes: state.service.options().view.staging_writes,
        active_locks: state.service.locks().active_count(),
        peak_rss_bytes: get_peak_rss_bytes(),
    })
}
