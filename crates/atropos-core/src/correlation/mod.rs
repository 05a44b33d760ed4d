//! Audit-finding correlation.
//!
//! Compliance audits are imported as JSON reports and held in a
//! process-scoped store keyed by audit id, so import and query can arrive as
//! independent requests. Correlation joins a node's failed findings against
//! its journal cuts: the earliest cut at-or-after a finding and within the
//! window remediates it, and effectiveness is the remediated share.

use std::collections::HashMap;
use std::io::Read;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One observation from an external compliance audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFinding {
    pub control_id: String,
    #[serde(default)]
    pub control_title: String,
    pub collector_type: String,
    pub node: String,
    pub passed: bool,
    #[serde(default)]
    pub evidence: serde_json::Value,
    #[serde(default)]
    pub command: String,
    /// RFC3339; findings with unparseable timestamps are skipped during
    /// correlation.
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSummary {
    #[serde(default)]
    pub total_checks: usize,
    #[serde(default)]
    pub passed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub pass_rate: f64,
    #[serde(default)]
    pub by_control: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub entropy_detected: bool,
}

/// A full imported audit report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub audit_id: String,
    #[serde(default)]
    pub baseline_version: String,
    #[serde(default)]
    pub standard: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub generated_at: String,
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub findings: Vec<AuditFinding>,
    #[serde(default)]
    pub summary: AuditSummary,
}

/// Slimmed view of a journal cut, enough for the join.
#[derive(Debug, Clone, Serialize)]
pub struct CutReference {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub success: bool,
}

/// A failed finding matched to the cut that remediated it.
#[derive(Debug, Clone, Serialize)]
pub struct Correlation {
    pub finding: AuditFinding,
    pub cut: CutReference,
    pub time_delta_seconds: i64,
    /// Whether the matched cut actually succeeded.
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationResult {
    pub findings: Vec<AuditFinding>,
    pub cuts: Vec<CutReference>,
    pub remediated: Vec<Correlation>,
    pub unresolved: Vec<AuditFinding>,
    /// Remediated share of failed findings, in percent. Zero when the node
    /// has no failed findings.
    pub effectiveness: f64,
}

/// Process-scoped store of imported audit reports, keyed by audit id.
/// Re-importing an audit id replaces the previous report.
#[derive(Default)]
pub struct ReportStore {
    reports: RwLock<HashMap<String, AuditReport>>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a report from a reader and store it.
    pub fn import(&self, reader: impl Read) -> Result<AuditReport, serde_json::Error> {
        let report: AuditReport = serde_json::from_reader(reader)?;
        self.insert(report.clone());
        Ok(report)
    }

    pub fn insert(&self, report: AuditReport) {
        let mut reports = self.reports.write().unwrap_or_else(|e| e.into_inner());
        reports.insert(report.audit_id.clone(), report);
    }

    pub fn get(&self, audit_id: &str) -> Option<AuditReport> {
        let reports = self.reports.read().unwrap_or_else(|e| e.into_inner());
        reports.get(audit_id).cloned()
    }

    pub fn list(&self) -> Vec<AuditReport> {
        let reports = self.reports.read().unwrap_or_else(|e| e.into_inner());
        reports.values().cloned().collect()
    }
}

/// Joins one node's failed findings against its cut history.
pub struct Correlator<'a> {
    store: &'a ReportStore,
    cut_refs: Vec<CutReference>,
}

impl<'a> Correlator<'a> {
    pub fn new(store: &'a ReportStore, cut_refs: Vec<CutReference>) -> Self {
        Self { store, cut_refs }
    }

    /// Correlate failed findings for `node` against cuts from the last
    /// `window` before `now`.
    pub fn correlate(
        &self,
        node: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> CorrelationResult {
        let failed_findings = self.failed_findings(node);

        let mut cuts_in_window: Vec<CutReference> = self
            .cut_refs
            .iter()
            .filter(|c| c.timestamp > now - window)
            .cloned()
            .collect();
        // Earliest first, so the first match is the soonest cut after the
        // finding.
        cuts_in_window.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut remediated = Vec::new();
        for finding in &failed_findings {
            let Ok(finding_time) = DateTime::parse_from_rfc3339(&finding.timestamp) else {
                continue;
            };
            let finding_time = finding_time.with_timezone(&Utc);

            let matched = cuts_in_window.iter().find(|cut| {
                let delta = cut.timestamp - finding_time;
                delta >= Duration::zero() && delta <= window
            });

            if let Some(cut) = matched {
                remediated.push(Correlation {
                    finding: finding.clone(),
                    cut: cut.clone(),
                    time_delta_seconds: (cut.timestamp - finding_time).num_seconds(),
                    resolved: cut.success,
                });
            }
        }

        let unresolved: Vec<AuditFinding> = failed_findings
            .iter()
            .filter(|finding| {
                !remediated.iter().any(|corr| {
                    corr.finding.control_id == finding.control_id
                        && corr.finding.collector_type == finding.collector_type
                        && corr.finding.timestamp == finding.timestamp
                })
            })
            .cloned()
            .collect();

        let effectiveness = if failed_findings.is_empty() {
            0.0
        } else {
            remediated.len() as f64 / failed_findings.len() as f64 * 100.0
        };

        CorrelationResult {
            findings: failed_findings,
            cuts: cuts_in_window,
            remediated,
            unresolved,
            effectiveness,
        }
    }

    /// Count of failed findings per control id for `node`.
    pub fn triggering_controls(&self, node: &str) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for finding in self.failed_findings(node) {
            *counts.entry(finding.control_id).or_default() += 1;
        }
        counts
    }

    fn failed_findings(&self, node: &str) -> Vec<AuditFinding> {
        let mut findings = Vec::new();
        for report in self.store.list() {
            for finding in report.findings {
                if finding.node == node && !finding.passed {
                    findings.push(finding);
                }
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(control: &str, node: &str, passed: bool, ts: DateTime<Utc>) -> AuditFinding {
        AuditFinding {
            control_id: control.to_string(),
            control_title: format!("{control} title"),
            collector_type: "file_integrity".to_string(),
            node: node.to_string(),
            passed,
            evidence: serde_json::json!({}),
            command: String::new(),
            timestamp: ts.to_rfc3339(),
        }
    }

    fn cut(id: &str, ts: DateTime<Utc>, success: bool) -> CutReference {
        CutReference {
            id: id.to_string(),
            timestamp: ts,
            action: "docker_stop_all".to_string(),
            success,
        }
    }

    fn report(audit_id: &str, findings: Vec<AuditFinding>) -> AuditReport {
        AuditReport {
            audit_id: audit_id.to_string(),
            baseline_version: "2.1".to_string(),
            standard: "CIS".to_string(),
            organization: "ops".to_string(),
            generated_at: Utc::now().to_rfc3339(),
            nodes: vec!["athena".to_string()],
            findings,
            summary: AuditSummary::default(),
        }
    }

    #[test]
    fn import_decodes_and_stores_by_audit_id() {
        let store = ReportStore::new();
        let json = serde_json::to_vec(&report("audit-7", vec![])).unwrap();

        let imported = store.import(json.as_slice()).unwrap();
        assert_eq!(imported.audit_id, "audit-7");
        assert!(store.get("audit-7").is_some());
        assert!(store.get("audit-8").is_none());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn import_rejects_malformed_json() {
        let store = ReportStore::new();
        assert!(store.import(&b"not json"[..]).is_err());
    }

    #[test]
    fn correlate_matches_first_cut_after_finding() {
        let now = Utc::now();
        let t = now - Duration::minutes(30);

        let store = ReportStore::new();
        store.insert(report(
            "audit-1",
            vec![
                finding("CIS-1.1", "athena", false, t),
                finding("CIS-2.4", "athena", false, t + Duration::minutes(10)),
            ],
        ));

        // A successful cut two minutes after the first finding; nothing near
        // the second.
        let correlator = Correlator::new(
            &store,
            vec![cut("cut_1_athena", t + Duration::minutes(2), true)],
        );
        let result = correlator.correlate("athena", Duration::hours(24), now);

        assert_eq!(result.findings.len(), 2);
        assert_eq!(result.remediated.len(), 1);
        assert_eq!(result.remediated[0].time_delta_seconds, 120);
        assert!(result.remediated[0].resolved);
        assert_eq!(result.unresolved.len(), 1);
        assert_eq!(result.unresolved[0].control_id, "CIS-2.4");
        assert_eq!(result.effectiveness, 50.0);
    }

    #[test]
    fn cut_before_finding_does_not_remediate() {
        let now = Utc::now();
        let t = now - Duration::minutes(30);

        let store = ReportStore::new();
        store.insert(report("audit-1", vec![finding("CIS-1.1", "athena", false, t)]));

        let correlator = Correlator::new(
            &store,
            vec![cut("cut_1_athena", t - Duration::minutes(5), true)],
        );
        let result = correlator.correlate("athena", Duration::hours(24), now);

        assert!(result.remediated.is_empty());
        assert_eq!(result.unresolved.len(), 1);
        assert_eq!(result.effectiveness, 0.0);
    }

    #[test]
    fn failed_cut_remediates_but_stays_unresolved_flag() {
        let now = Utc::now();
        let t = now - Duration::minutes(30);

        let store = ReportStore::new();
        store.insert(report("audit-1", vec![finding("CIS-1.1", "athena", false, t)]));

        let correlator = Correlator::new(
            &store,
            vec![cut("cut_1_athena", t + Duration::minutes(1), false)],
        );
        let result = correlator.correlate("athena", Duration::hours(24), now);

        assert_eq!(result.remediated.len(), 1);
        assert!(!result.remediated[0].resolved);
        assert_eq!(result.effectiveness, 100.0);
    }

    #[test]
    fn earliest_matching_cut_wins() {
        let now = Utc::now();
        let t = now - Duration::minutes(30);

        let store = ReportStore::new();
        store.insert(report("audit-1", vec![finding("CIS-1.1", "athena", false, t)]));

        let correlator = Correlator::new(
            &store,
            vec![
                cut("late", t + Duration::minutes(20), true),
                cut("early", t + Duration::minutes(3), true),
            ],
        );
        let result = correlator.correlate("athena", Duration::hours(24), now);

        assert_eq!(result.remediated[0].cut.id, "early");
        assert_eq!(result.remediated[0].time_delta_seconds, 180);
    }

    #[test]
    fn passing_and_foreign_findings_ignored() {
        let now = Utc::now();
        let t = now - Duration::minutes(30);

        let store = ReportStore::new();
        store.insert(report(
            "audit-1",
            vec![
                finding("CIS-1.1", "athena", true, t),
                finding("CIS-1.1", "hermes", false, t),
            ],
        ));

        let correlator = Correlator::new(&store, vec![]);
        let result = correlator.correlate("athena", Duration::hours(24), now);

        assert!(result.findings.is_empty());
        assert_eq!(result.effectiveness, 0.0);
    }

    #[test]
    fn unparseable_finding_timestamp_is_skipped() {
        let now = Utc::now();
        let mut bad = finding("CIS-9.9", "athena", false, now - Duration::minutes(10));
        bad.timestamp = "yesterday-ish".to_string();

        let store = ReportStore::new();
        store.insert(report("audit-1", vec![bad]));

        let correlator = Correlator::new(
            &store,
            vec![cut("cut_1_athena", now - Duration::minutes(5), true)],
        );
        let result = correlator.correlate("athena", Duration::hours(24), now);

        // Counted as failed, never matched, so it lands in unresolved.
        assert_eq!(result.findings.len(), 1);
        assert!(result.remediated.is_empty());
        assert_eq!(result.unresolved.len(), 1);
    }

    #[test]
    fn triggering_controls_counts_by_control_id() {
        let now = Utc::now();
        let store = ReportStore::new();
        store.insert(report(
            "audit-1",
            vec![
                finding("CIS-1.1", "athena", false, now),
                finding("CIS-1.1", "athena", false, now - Duration::hours(1)),
                finding("CIS-2.4", "athena", false, now),
                finding("CIS-3.0", "athena", true, now),
            ],
        ));

        let correlator = Correlator::new(&store, vec![]);
        let controls = correlator.triggering_controls("athena");

        assert_eq!(controls["CIS-1.1"], 2);
        assert_eq!(controls["CIS-2.4"], 1);
        assert!(!controls.contains_key("CIS-3.0"));
    }
}
