//! Persistent record of finished sessions (Sled).

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::JournalError;
use crate::pipeline::PipelineStage;

const PLANS_TREE: &str = "plans";

/// One finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub session_id: u64,
    /// Unix seconds when the session finished.
    pub timestamp: u64,
    pub transcript: String,
    /// CONFIRMING on success, ERROR otherwise.
    pub final_stage: PipelineStage,
    pub message: String,
    pub waypoint_count: usize,
    pub narration: Vec<String>,
    pub requires_confirmation: bool,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Append-only journal of session outcomes, queryable by time.
#[derive(Debug, Clone)]
pub struct PlanJournal {
    db: sled::Db,
}

impl PlanJournal {
    /// Opens or creates the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        Ok(Self::from_db(sled::open(path)?))
    }

    /// Wraps an already-open database, e.g. a temporary one.
    pub fn from_db(db: sled::Db) -> Self {
        Self { db }
    }

    pub fn record(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let tree = self.db.open_tree(PLANS_TREE)?;
        let id = self.db.generate_id()?;

        // Zero-padded so lexicographic order is time order.
        let key = format!("{:020}_{id}", entry.timestamp);
        let value = serde_json::to_vec(entry)?;

        tree.insert(key.as_bytes(), value)?;
        tree.flush()?;
        Ok(())
    }

    /// Entries finished at or after `start_ts` (unix seconds), oldest first.
    pub fn entries_since(&self, start_ts: u64) -> Vec<JournalEntry> {
        let Ok(tree) = self.db.open_tree(PLANS_TREE) else {
            return Vec::new();
        };

        tree.range(format!("{start_ts:020}").as_bytes()..)
            .filter_map(|res| res.ok())
            .filter_map(|(_, v)| serde_json::from_slice::<JournalEntry>(&v).ok())
            .collect()
    }

    pub fn latest(&self) -> Option<JournalEntry> {
        let tree = self.db.open_tree(PLANS_TREE).ok()?;
        let (_, v) = tree.last().ok()??;
        serde_json::from_slice(&v).ok()
    }

    pub fn len(&self) -> usize {
        self.db.open_tree(PLANS_TREE).map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal() -> PlanJournal {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        PlanJournal::from_db(db)
    }

    fn entry(session_id: u64, timestamp: u64, final_stage: PipelineStage) -> JournalEntry {
        JournalEntry {
            session_id,
            timestamp,
            transcript: format!("command {session_id}"),
            final_stage,
            message: "Done.".to_string(),
            waypoint_count: 3,
            narration: vec!["Waiting".to_string()],
            requires_confirmation: false,
            error: None,
        }
    }

    #[test]
    fn entries_come_back_in_time_order_from_start() {
        let journal = temp_journal();
        journal.record(&entry(2, 200, PipelineStage::Error)).unwrap();
        journal.record(&entry(1, 100, PipelineStage::Confirming)).unwrap();
        journal.record(&entry(3, 300, PipelineStage::Confirming)).unwrap();

        let ids: Vec<u64> = journal.entries_since(150).iter().map(|e| e.session_id).collect();
        assert_eq!(ids, [2, 3]);
        assert_eq!(journal.entries_since(0).len(), 3);
        assert_eq!(journal.len(), 3);
    }

    #[test]
    fn latest_is_most_recent_timestamp() {
        let journal = temp_journal();
        assert!(journal.latest().is_none());
        assert!(journal.is_empty());

        journal.record(&entry(9, 500, PipelineStage::Confirming)).unwrap();
        journal.record(&entry(4, 50, PipelineStage::Error)).unwrap();
        assert_eq!(journal.latest().map(|e| e.session_id), Some(9));
    }
}
