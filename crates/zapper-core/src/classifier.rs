//! Error classifier
//!
//! Severity comes from the engine's own fault metadata. Critical faults are
//! surfaced to the viewer and demote the channel in the offline registry;
//! recoverable ones only reach the log, since the engine's retry policy
//! usually heals them.

use crate::offline::OfflineRegistry;
use crate::types::{EngineFault, FaultCategory, SessionId, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Default number of reports kept for inspection
pub const DEFAULT_REPORT_CAPACITY: usize = 64;

/// Serializable record of one classified fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub channel_id: Option<String>,
    pub session_id: Option<SessionId>,
    pub severity: Severity,
    pub code: String,
    pub category: FaultCategory,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome of classifying a fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub severity: Severity,
    pub report: FaultReport,
}

impl Classification {
    /// Whether the viewer should see an error state
    pub fn is_user_visible(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Buckets engine faults and applies their consequences
pub struct ErrorClassifier {
    registry: Arc<OfflineRegistry>,
    reports: Mutex<VecDeque<FaultReport>>,
    capacity: usize,
}

impl ErrorClassifier {
    pub fn new(registry: Arc<OfflineRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_REPORT_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<OfflineRegistry>, capacity: usize) -> Self {
        Self {
            registry,
            reports: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn registry(&self) -> &Arc<OfflineRegistry> {
        &self.registry
    }

    /// Classify without side effects
    pub fn classify(
        &self,
        fault: &EngineFault,
        channel_id: Option<&str>,
        session_id: Option<SessionId>,
    ) -> Classification {
        Classification {
            severity: fault.severity,
            report: FaultReport {
                channel_id: channel_id.map(str::to_string),
                session_id,
                severity: fault.severity,
                code: fault.code.clone(),
                category: fault.category,
                message: fault.message.clone(),
                at: Utc::now(),
            },
        }
    }

    /// Classify, log, record, and mark the channel offline when critical
    pub fn handle(
        &self,
        fault: &EngineFault,
        channel_id: Option<&str>,
        session_id: Option<SessionId>,
    ) -> Classification {
        let classification = self.classify(fault, channel_id, session_id);

        match classification.severity {
            Severity::Recoverable => {
                warn!(
                    channel = ?channel_id,
                    code = %fault.code,
                    category = %fault.category,
                    message = %fault.message,
                    "Recoverable engine fault"
                );
            }
            Severity::Critical => {
                error!(
                    channel = ?channel_id,
                    code = %fault.code,
                    category = %fault.category,
                    message = %fault.message,
                    "Critical engine fault"
                );
                if let Some(channel_id) = channel_id {
                    if let Err(e) = self.registry.mark_offline(channel_id) {
                        warn!(channel = channel_id, error = %e, "Failed to persist offline channel");
                    }
                }
            }
        }

        self.record(classification.report.clone());
        classification
    }

    /// Most recent reports, oldest first
    pub fn recent(&self) -> Vec<FaultReport> {
        self.reports
            .lock()
            .map(|reports| reports.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, report: FaultReport) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut reports) = self.reports.lock() {
            while reports.len() >= self.capacity {
                reports.pop_front();
            }
            reports.push_back(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn classifier() -> ErrorClassifier {
        let registry = OfflineRegistry::with_default_key(Arc::new(MemoryStore::new()));
        ErrorClassifier::with_capacity(Arc::new(registry), 2)
    }

    #[test]
    fn test_severity_is_taken_from_fault() {
        let classifier = classifier();
        let fault = EngineFault::critical("3016", FaultCategory::Media, "decode error");
        let classification = classifier.classify(&fault, Some("news"), None);

        assert_eq!(classification.severity, Severity::Critical);
        assert!(classification.is_user_visible());
        assert_eq!(classification.report.code, "3016");
        assert!(!classifier.registry().is_offline("news").unwrap());
    }

    #[test]
    fn test_critical_marks_offline() {
        let classifier = classifier();
        let fault = EngineFault::critical("6007", FaultCategory::Drm, "license failed");
        classifier.handle(&fault, Some("news"), None);
        assert!(classifier.registry().is_offline("news").unwrap());
    }

    #[test]
    fn test_recoverable_only_logs() {
        let classifier = classifier();
        let fault = EngineFault::recoverable("1001", FaultCategory::Network, "segment 503");
        let classification = classifier.handle(&fault, Some("news"), None);

        assert!(!classification.is_user_visible());
        assert!(classifier.registry().list().unwrap().is_empty());
        assert_eq!(classifier.recent().len(), 1);
    }

    #[test]
    fn test_report_buffer_is_bounded() {
        let classifier = classifier();
        for code in ["1", "2", "3"] {
            classifier.handle(
                &EngineFault::recoverable(code, FaultCategory::Network, "x"),
                None,
                None,
            );
        }
        let codes: Vec<_> = classifier.recent().into_iter().map(|r| r.code).collect();
        assert_eq!(codes, vec!["2", "3"]);
    }
}
