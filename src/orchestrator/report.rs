//! Run reports: what a completed (or failed) run looked like.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::goals::GoalSummary;
use crate::session::SessionId;

/// Outcome of one phase within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    /// 0 when the output came from the cache.
    pub attempts: u32,
    pub duration_ms: u64,
    /// Heuristic quality score in [0, 1], derived from attempts and overrun.
    pub quality: f64,
    /// Whether the phase was inserted mid-run (recovery or expansion).
    pub inserted: bool,
}

/// Summary of a whole orchestrated run, persisted under `reports/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: SessionId,
    pub request: String,
    pub request_type: String,
    pub success: bool,
    pub phases: Vec<PhaseRecord>,
    pub goals: Vec<GoalSummary>,
    /// Mean phase quality, in [0, 1].
    pub overall_quality: f64,
    pub final_word_count: usize,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl RunReport {
    pub fn report_path(&self) -> String {
        format!("reports/{}.json", self.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_round_trip() {
        let report = RunReport {
            session_id: SessionId::from_string("s-report"),
            request: "write a story".into(),
            request_type: "fiction".into(),
            success: true,
            phases: vec![PhaseRecord {
                name: "Drafting".into(),
                attempts: 1,
                duration_ms: 1200,
                quality: 0.92,
                inserted: false,
            }],
            goals: Vec::new(),
            overall_quality: 0.92,
            final_word_count: 4200,
            duration_ms: 1500,
            timestamp: Utc::now(),
        };

        assert_eq!(report.report_path(), "reports/s-report.json");
        let text = serde_json::to_string_pretty(&report).unwrap();
        let parsed: RunReport = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.phases.len(), 1);
        assert!(parsed.success);
    }
}
