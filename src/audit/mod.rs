//! Decision Log + Audit Store (spec.md §4.11): append-only JSONL per
//! trader per day, streaming tail reads.

use crate::agent::types::{Decision, DecisionAudit};
use crate::persist;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub struct DecisionLog {
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct SavedRecord<T> {
    saved_ts_ms: i64,
    #[serde(flatten)]
    record: T,
}

impl DecisionLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn day_path(&self, trader_id: &str, day: chrono::NaiveDate) -> PathBuf {
        self.base_dir.join(trader_id).join(format!("{day}.jsonl"))
    }

    pub async fn append(
        &self,
        trader_id: &str,
        day: chrono::NaiveDate,
        decision: &Decision,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        let record = SavedRecord {
            saved_ts_ms: now_ms,
            record: decision.clone(),
        };
        persist::append_jsonl(&self.day_path(trader_id, day), &record).await
    }

    /// Scan files in reverse filename order (most recent day first),
    /// tailing each until `limit` records are gathered, then sort by
    /// `saved_ts_ms` descending (spec.md §4.11 `ListLatest`).
    pub fn list_latest(&self, trader_id: &str, limit: usize) -> Vec<Decision> {
        let dir = self.base_dir.join(trader_id);
        let mut days = list_day_files(&dir);
        days.sort_by(|a, b| b.cmp(a));

        let mut out: Vec<SavedRecord<Decision>> = Vec::new();
        for day_path in days {
            if out.len() >= limit {
                break;
            }
            let remaining = limit - out.len();
            out.extend(persist::tail_jsonl::<SavedRecord<Decision>>(
                &day_path, remaining,
            ));
        }
        out.sort_by_key(|r| std::cmp::Reverse(r.saved_ts_ms));
        out.truncate(limit);
        out.into_iter().map(|r| r.record).collect()
    }

    pub fn for_day(&self, trader_id: &str, day: chrono::NaiveDate, limit: usize) -> Vec<Decision> {
        persist::tail_jsonl::<SavedRecord<Decision>>(&self.day_path(trader_id, day), limit)
            .into_iter()
            .map(|r| r.record)
            .collect()
    }
}

pub struct DecisionAuditStore {
    base_dir: PathBuf,
}

impl DecisionAuditStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn day_path(&self, trader_id: &str, day: chrono::NaiveDate) -> PathBuf {
        self.base_dir.join(trader_id).join(format!("{day}.jsonl"))
    }

    pub async fn append(
        &self,
        trader_id: &str,
        day: chrono::NaiveDate,
        audit: &DecisionAudit,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        let record = SavedRecord {
            saved_ts_ms: now_ms,
            record: audit.clone(),
        };
        persist::append_jsonl(&self.day_path(trader_id, day), &record).await
    }

    pub fn list_latest(&self, trader_id: &str, limit: usize) -> Vec<DecisionAudit> {
        let dir = self.base_dir.join(trader_id);
        let mut days = list_day_files(&dir);
        days.sort_by(|a, b| b.cmp(a));

        let mut out: Vec<SavedRecord<DecisionAudit>> = Vec::new();
        for day_path in days {
            if out.len() >= limit {
                break;
            }
            let remaining = limit - out.len();
            out.extend(persist::tail_jsonl::<SavedRecord<DecisionAudit>>(
                &day_path, remaining,
            ));
        }
        out.sort_by_key(|r| std::cmp::Reverse(r.saved_ts_ms));
        out.truncate(limit);
        out.into_iter().map(|r| r.record).collect()
    }

    pub fn for_day(
        &self,
        trader_id: &str,
        day: chrono::NaiveDate,
        limit: usize,
    ) -> Vec<DecisionAudit> {
        persist::tail_jsonl::<SavedRecord<DecisionAudit>>(&self.day_path(trader_id, day), limit)
            .into_iter()
            .map(|r| r.record)
            .collect()
    }
}

fn list_day_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::Action;

    fn decision(cycle: u64) -> Decision {
        Decision {
            timestamp: chrono::Utc::now(),
            cycle_number: cycle,
            trader_id: "t1".into(),
            symbol: "AAPL".into(),
            action: Action::Hold,
            quantity: 0,
            confidence: 0.5,
            reasoning: "x".into(),
            decision_source: "test".into(),
            executed: false,
            llm_meta: None,
            decisions: vec![],
            execution_log: vec![],
        }
    }

    #[tokio::test]
    async fn append_then_list_latest_returns_in_descending_save_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = DecisionLog::new(dir.path());
        let today = chrono::Utc::now().date_naive();
        for i in 0..5u64 {
            log.append("t1", today, &decision(i), i as i64).await.unwrap();
        }
        let latest = log.list_latest("t1", 3);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].cycle_number, 4);
        assert_eq!(latest[2].cycle_number, 2);
    }

    #[tokio::test]
    async fn for_day_reads_only_that_days_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = DecisionLog::new(dir.path());
        let day = chrono::NaiveDate::from_ymd_opt(2026, 7, 31).unwrap();
        log.append("t1", day, &decision(1), 1).await.unwrap();
        let recs = log.for_day("t1", day, 10);
        assert_eq!(recs.len(), 1);
    }
}
