//! Per-content daily play counts and limits.
//!
//! Counts are only meaningful for the calendar day stored alongside them.
//! There is no midnight job: the first `can_play_today` or `record_playback`
//! after the date changes resets the count and persists the reset. Read-only
//! projections apply the same rule without writing anything back.

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::kv_store::{KeyValueStore, REPETITIONS_KEY};

/// Sentinel daily limit meaning "no cap".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepetitionRecord {
    pub content_id: String,
    pub daily_count: u32,
    pub last_play_date: NaiveDate,
    pub daily_limit: i64,
    pub is_unlimited: bool,
}

impl RepetitionRecord {
    fn new(content_id: &str, today: NaiveDate) -> Self {
        Self {
            content_id: content_id.to_string(),
            daily_count: 0,
            last_play_date: today,
            daily_limit: UNLIMITED,
            is_unlimited: true,
        }
    }

    pub fn is_capped(&self) -> bool {
        !self.is_unlimited && self.daily_limit >= 0
    }

    pub fn count_on(&self, today: NaiveDate) -> u32 {
        if self.last_play_date == today {
            self.daily_count
        } else {
            0
        }
    }

    pub fn can_play_on(&self, today: NaiveDate) -> bool {
        !self.is_capped() || i64::from(self.count_on(today)) < self.daily_limit
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackInfo {
    pub played: u32,
    pub limit: i64,
    pub can_play: bool,
    pub is_unlimited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStats {
    pub reproductions_today: u32,
    pub daily_limit: i64,
    pub is_unlimited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub total_contents: usize,
    pub active_today: usize,
    pub completed_today: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentLimitStatus {
    pub content_id: String,
    pub reproductions_today: u32,
    pub daily_limit: i64,
    pub last_play_date: NaiveDate,
    pub can_play_today: bool,
    pub is_unlimited: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerExport {
    records: Vec<RepetitionRecord>,
    export_date: String,
}

pub struct RepetitionLedger {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    records: Mutex<BTreeMap<String, RepetitionRecord>>,
}

impl RepetitionLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let records = load_records(store.as_ref());
        tracing::debug!("Repetition ledger loaded {} record(s)", records.len());
        Self {
            store,
            clock,
            records: Mutex::new(records),
        }
    }

    /// Upserts the limit for a content item. With `is_unlimited` the limit is
    /// kept but not enforced.
    pub fn set_daily_limit(&self, content_id: &str, limit: i64, is_unlimited: bool) {
        let today = self.clock.today();
        let mut records = self.records.lock();
        let record = records
            .entry(content_id.to_string())
            .or_insert_with(|| RepetitionRecord::new(content_id, today));
        record.daily_limit = limit;
        record.is_unlimited = is_unlimited;

        tracing::info!(
            "Daily limit for {} set to {}",
            content_id,
            if is_unlimited {
                "unlimited".to_string()
            } else {
                limit.to_string()
            }
        );
        self.persist(&records);
    }

    pub fn can_play_today(&self, content_id: &str) -> bool {
        let today = self.clock.today();
        let mut records = self.records.lock();

        let (allowed, rolled_over) = match records.get_mut(content_id) {
            None => return true,
            Some(record) if !record.is_capped() => return true,
            Some(record) if record.last_play_date != today => {
                record.daily_count = 0;
                record.last_play_date = today;
                (true, true)
            }
            Some(record) => (i64::from(record.daily_count) < record.daily_limit, false),
        };

        if rolled_over {
            tracing::debug!("New day for {}, daily count reset", content_id);
            self.persist(&records);
        }
        allowed
    }

    /// Counts one play. Every call advances the count; one tick is one play.
    pub fn record_playback(&self, content_id: &str) {
        let today = self.clock.today();
        let mut records = self.records.lock();

        let count = match records.get_mut(content_id) {
            None => {
                let mut record = RepetitionRecord::new(content_id, today);
                record.daily_count = 1;
                records.insert(content_id.to_string(), record);
                tracing::debug!("First playback recorded for {}", content_id);
                1
            }
            Some(record) if record.last_play_date != today => {
                record.daily_count = 1;
                record.last_play_date = today;
                tracing::debug!("New day detected for {}, count reset to 1", content_id);
                1
            }
            Some(record) => {
                record.daily_count += 1;
                record.daily_count
            }
        };

        tracing::debug!("Playback recorded for {} (today: {})", content_id, count);
        self.persist(&records);
    }

    pub fn get_playback_info(&self, content_id: &str) -> PlaybackInfo {
        let today = self.clock.today();
        match self.records.lock().get(content_id) {
            None => PlaybackInfo {
                played: 0,
                limit: UNLIMITED,
                can_play: true,
                is_unlimited: true,
            },
            Some(record) => PlaybackInfo {
                played: record.count_on(today),
                limit: record.daily_limit,
                can_play: record.can_play_on(today),
                is_unlimited: record.is_unlimited,
            },
        }
    }

    pub fn get_content_stats(&self, content_id: &str) -> Option<ContentStats> {
        let today = self.clock.today();
        self.records
            .lock()
            .get(content_id)
            .map(|record| ContentStats {
                reproductions_today: record.count_on(today),
                daily_limit: record.daily_limit,
                is_unlimited: record.is_unlimited,
            })
    }

    /// Raw stored record, without any day rollover applied.
    pub fn record(&self, content_id: &str) -> Option<RepetitionRecord> {
        self.records.lock().get(content_id).cloned()
    }

    pub fn clear_content_data(&self, content_id: &str) {
        let mut records = self.records.lock();
        if records.remove(content_id).is_some() {
            tracing::info!("Repetition data cleared for {}", content_id);
            self.persist(&records);
        }
    }

    pub fn clear_all_data(&self) {
        self.records.lock().clear();
        if let Err(e) = self.store.remove(REPETITIONS_KEY) {
            tracing::error!("Failed to clear repetition data: {}", e);
        }
    }

    pub fn summary(&self) -> LedgerSummary {
        let today = self.clock.today();
        let records = self.records.lock();
        let mut summary = LedgerSummary {
            total_contents: records.len(),
            active_today: 0,
            completed_today: 0,
        };

        for record in records.values().filter(|r| r.last_play_date == today) {
            if record.can_play_on(today) {
                summary.active_today += 1;
            } else {
                summary.completed_today += 1;
            }
        }
        summary
    }

    pub fn all_stats(&self) -> Vec<ContentLimitStatus> {
        let today = self.clock.today();
        self.records
            .lock()
            .values()
            .map(|record| ContentLimitStatus {
                content_id: record.content_id.clone(),
                reproductions_today: record.count_on(today),
                daily_limit: record.daily_limit,
                last_play_date: record.last_play_date,
                can_play_today: record.can_play_on(today),
                is_unlimited: record.is_unlimited,
            })
            .collect()
    }

    pub fn export_json(&self) -> serde_json::Result<String> {
        let export = LedgerExport {
            records: self.records.lock().values().cloned().collect(),
            export_date: self.clock.now().to_rfc3339(),
        };
        serde_json::to_string_pretty(&export)
    }

    /// Replaces every record. Returns false, leaving state untouched, when
    /// the payload is not a `{ "records": [...] }` document.
    pub fn import_json(&self, data: &str) -> bool {
        let parsed: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Error importing repetition data: {}", e);
                return false;
            }
        };

        let Some(list) = parsed.get("records").filter(|r| r.is_array()) else {
            tracing::error!("Error importing repetition data: missing records array");
            return false;
        };

        let imported: Vec<RepetitionRecord> = match serde_json::from_value(list.clone()) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Error importing repetition data: {}", e);
                return false;
            }
        };

        let mut records = self.records.lock();
        *records = imported
            .into_iter()
            .map(|r| (r.content_id.clone(), r))
            .collect();
        tracing::info!("Imported {} repetition record(s)", records.len());
        self.persist(&records);
        true
    }

    /// Failures are logged; in-memory state stays authoritative.
    fn persist(&self, records: &BTreeMap<String, RepetitionRecord>) {
        let list: Vec<&RepetitionRecord> = records.values().collect();
        let result = serde_json::to_string(&list)
            .map_err(crate::error::StoreError::from)
            .and_then(|json| self.store.set(REPETITIONS_KEY, &json));
        if let Err(e) = result {
            tracing::error!("Error saving repetition data: {}", e);
        }
    }
}

fn load_records(store: &dyn KeyValueStore) -> BTreeMap<String, RepetitionRecord> {
    let raw = match store.get(REPETITIONS_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return BTreeMap::new(),
        Err(e) => {
            tracing::error!("Error loading repetition data: {}", e);
            return BTreeMap::new();
        }
    };

    match serde_json::from_str::<Vec<RepetitionRecord>>(&raw) {
        Ok(list) => list
            .into_iter()
            .map(|r| (r.content_id.clone(), r))
            .collect(),
        Err(e) => {
            tracing::error!("Stored repetition data is unreadable: {}", e);
            BTreeMap::new()
        }
    }
}
