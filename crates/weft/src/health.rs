// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Health rollup for embedding services.
//!
//! The orchestration layer owns no HTTP surface; embedders poll
//! [`HealthReport`] and expose it however they like. `degraded` means the
//! breaker is open or the cache failed startup validation but requests can
//! still be served; `down` means they cannot.

use crate::cache::CacheHealth;
use crate::supervisor::{BreakerState, SupervisorState};
use serde::Serialize;

/// Overall serving health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Serving normally.
    Ready,
    /// Serving with reduced guarantees.
    Degraded,
    /// Not serving.
    Down,
}

/// Point-in-time health report.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Baseline supervisor state.
    pub supervisor: SupervisorState,
    /// Whether the baseline transport is usable.
    pub transport_connected: bool,
    /// Circuit breaker state.
    pub breaker: BreakerState,
    /// Cache health.
    pub cache: CacheHealth,
}

/// Fold component states into one status.
#[must_use]
pub fn assess(
    supervisor: SupervisorState,
    transport_connected: bool,
    breaker: BreakerState,
    cache: CacheHealth,
) -> HealthReport {
    let status = match supervisor {
        SupervisorState::Fatal | SupervisorState::Stopped | SupervisorState::Idle => {
            HealthStatus::Down
        }
        SupervisorState::Starting => HealthStatus::Degraded,
        SupervisorState::Running => {
            if !transport_connected {
                HealthStatus::Down
            } else if breaker == BreakerState::Open || !cache.validated {
                HealthStatus::Degraded
            } else {
                HealthStatus::Ready
            }
        }
    };
    HealthReport {
        status,
        supervisor,
        transport_connected,
        breaker,
        cache,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_cache() -> CacheHealth {
        CacheHealth {
            validated: true,
            hit_rate: 0.9,
            entry_count: 3,
            total_bytes: 1_024,
        }
    }

    #[test]
    fn test_ready_when_everything_is_up() {
        let report = assess(
            SupervisorState::Running,
            true,
            BreakerState::Closed,
            healthy_cache(),
        );
        assert_eq!(report.status, HealthStatus::Ready);
    }

    #[test]
    fn test_open_breaker_degrades() {
        let report = assess(
            SupervisorState::Running,
            true,
            BreakerState::Open,
            healthy_cache(),
        );
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_failed_cache_validation_degrades() {
        let mut cache = healthy_cache();
        cache.validated = false;
        let report = assess(SupervisorState::Running, true, BreakerState::Closed, cache);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_disconnected_transport_is_down() {
        let report = assess(
            SupervisorState::Running,
            false,
            BreakerState::Closed,
            healthy_cache(),
        );
        assert_eq!(report.status, HealthStatus::Down);
    }

    #[test]
    fn test_fatal_and_stopped_are_down() {
        for state in [SupervisorState::Fatal, SupervisorState::Stopped, SupervisorState::Idle] {
            let report = assess(state, true, BreakerState::Closed, healthy_cache());
            assert_eq!(report.status, HealthStatus::Down, "{state:?}");
        }
    }

    #[test]
    fn test_half_open_breaker_still_ready() {
        let report = assess(
            SupervisorState::Running,
            true,
            BreakerState::HalfOpen,
            healthy_cache(),
        );
        assert_eq!(report.status, HealthStatus::Ready);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }
}
