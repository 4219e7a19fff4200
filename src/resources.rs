//! Query keys and per-resource query options for the dashboard API.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::key::{KeyPart, QueryKey};
use crate::query::{QueryOptions, RefetchInterval};

pub const USERS: &str = "users";
pub const TEAMS: &str = "teams";
pub const DASHBOARDS: &str = "dashboards";
pub const SLOS: &str = "slos";
pub const DIAGNOSTICS_REPORT: &str = "diagnostics-report";
pub const CHAOS_EXPERIMENTS: &str = "chaos-experiments";

/// Poll period of a diagnostics report while its scan is running.
pub const DIAGNOSTICS_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Retries for diagnostics report fetches.
pub const DIAGNOSTICS_RETRIES: u32 = 3;

pub fn users() -> QueryKey {
    QueryKey::new(USERS)
}

pub fn user(id: impl Into<KeyPart>) -> QueryKey {
    users().with(id)
}

pub fn teams() -> QueryKey {
    QueryKey::new(TEAMS)
}

pub fn team(id: impl Into<KeyPart>) -> QueryKey {
    teams().with(id)
}

pub fn dashboards() -> QueryKey {
    QueryKey::new(DASHBOARDS)
}

pub fn dashboard(id: impl Into<KeyPart>) -> QueryKey {
    dashboards().with(id)
}

pub fn slos() -> QueryKey {
    QueryKey::new(SLOS)
}

pub fn slo(id: impl Into<KeyPart>) -> QueryKey {
    slos().with(id)
}

pub fn chaos_experiments() -> QueryKey {
    QueryKey::new(CHAOS_EXPERIMENTS)
}

pub fn chaos_experiment(id: impl Into<KeyPart>) -> QueryKey {
    chaos_experiments().with(id)
}

/// `["diagnostics-report", service_env_id, version]`
pub fn diagnostics_report(
    service_env_id: impl Into<KeyPart>,
    version: impl Into<KeyPart>,
) -> QueryKey {
    QueryKey::new(DIAGNOSTICS_REPORT)
        .with(service_env_id)
        .with(version)
}

/// Scan state reported by the diagnostics backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScanStatus {
    InProgress,
    Pending,
    Success,
    Failed,
    /// Any status this client does not know; treated as settled.
    Other(String),
}

impl ScanStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ScanStatus::InProgress => "InProgress",
            ScanStatus::Pending => "Pending",
            ScanStatus::Success => "SUCCESS",
            ScanStatus::Failed => "FAILED",
            ScanStatus::Other(status) => status,
        }
    }

    /// Whether the scan is still running and worth polling.
    pub fn is_running(&self) -> bool {
        matches!(self, ScanStatus::InProgress | ScanStatus::Pending)
    }
}

impl From<String> for ScanStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "InProgress" => ScanStatus::InProgress,
            "Pending" => ScanStatus::Pending,
            "SUCCESS" => ScanStatus::Success,
            "FAILED" => ScanStatus::Failed,
            _ => ScanStatus::Other(status),
        }
    }
}

impl From<ScanStatus> for String {
    fn from(status: ScanStatus) -> Self {
        status.as_str().to_string()
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics report payload. Only `scanStatus` is interpreted; every
/// other field is kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    #[serde(rename = "scanStatus")]
    pub scan_status: ScanStatus,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Options for a diagnostics report query: poll every
/// [`DIAGNOSTICS_POLL_INTERVAL`] while the scan is running, stop once it
/// settles, and retry failed fetches [`DIAGNOSTICS_RETRIES`] times.
pub fn diagnostics_report_options(
    base: QueryOptions<DiagnosticsReport>,
) -> QueryOptions<DiagnosticsReport> {
    base.retry(DIAGNOSTICS_RETRIES)
        .refetch_interval(RefetchInterval::dynamic(diagnostics_poll_delay))
}

fn diagnostics_poll_delay(report: Option<&DiagnosticsReport>) -> Option<Duration> {
    report
        .filter(|report| report.scan_status.is_running())
        .map(|_| DIAGNOSTICS_POLL_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    fn report(status: &str) -> DiagnosticsReport {
        serde_json::from_value(serde_json::json!({ "scanStatus": status, "findings": 2 })).unwrap()
    }

    #[test]
    fn keys_share_resource_prefix() {
        assert_eq!(user(42), query_key!["users", 42]);
        assert!(team("core").starts_with(&teams()));
        assert_eq!(
            diagnostics_report("env-1", "v2").to_string(),
            r#"["diagnostics-report", "env-1", "v2"]"#
        );
    }

    #[test]
    fn parse_scan_status() {
        assert_eq!(report("Pending").scan_status, ScanStatus::Pending);
        assert_eq!(report("SUCCESS").scan_status, ScanStatus::Success);
        assert_eq!(
            report("Queued").scan_status,
            ScanStatus::Other("Queued".to_string())
        );
        assert_eq!(report("Pending").details["findings"], 2);
    }

    #[test]
    fn round_trip_keeps_wire_names() {
        let value = serde_json::to_value(report("InProgress")).unwrap();
        assert_eq!(value["scanStatus"], "InProgress");
        assert_eq!(value["findings"], 2);
    }

    #[test]
    fn polls_only_while_running() {
        let options = diagnostics_report_options(QueryOptions::new());
        let interval = &options.refetch_interval;
        assert_eq!(
            interval.next_delay(Some(&report("InProgress"))),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            interval.next_delay(Some(&report("Pending"))),
            Some(Duration::from_secs(10))
        );
        assert_eq!(interval.next_delay(Some(&report("SUCCESS"))), None);
        assert_eq!(interval.next_delay(None), None);
        assert_eq!(options.retry.retry_count(), 3);
    }
}
