//! Session-scoped reproduction statistics per content item.
//!
//! Scheduler-driven plays go through `sync_reproduction_count`, which sets the
//! count to the ledger's figure for today instead of incrementing it, so the
//! two subsystems never drift apart. `record_reproduction` increments and is
//! reserved for manual or simulated plays.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::kv_store::{KeyValueStore, REPRODUCTION_STATS_KEY};
use crate::models::{Content, ContentType, Program};

pub const TOP_CONTENT_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub reproductions: u64,
    pub last_reproduction: Option<DateTime<Utc>>,
    /// Program context of the most recent play (last writer wins).
    pub program_id: String,
    pub program_name: String,
    pub reproductions_per_minute: f64,
    #[serde(default)]
    pub total_duration: f64,
    #[serde(default)]
    pub average_session_time: f64,
}

/// Identifies what was played and where.
#[derive(Debug, Clone, Copy)]
pub struct PlaySource<'a> {
    pub content_id: &'a str,
    pub content_name: &'a str,
    pub content_type: ContentType,
    pub program_id: &'a str,
    pub program_name: &'a str,
}

impl<'a> PlaySource<'a> {
    pub fn new(program: &'a Program, content: &'a Content) -> Self {
        Self {
            content_id: &content.id,
            content_name: &content.name,
            content_type: content.content_type,
            program_id: &program.id,
            program_name: &program.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopContent {
    pub id: String,
    pub name: String,
    pub reproductions: u64,
    #[serde(rename = "type")]
    pub content_type: ContentType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    /// Distinct program ids seen in telemetry, not the live program count.
    pub total_programs: usize,
    pub total_content: usize,
    pub total_reproductions: u64,
    /// Whole minutes since session start.
    pub session_duration: u64,
    pub reproductions_per_minute: f64,
    pub top_content: Vec<TopContent>,
    pub last_updated: DateTime<Utc>,
}

/// Flattened row for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRow {
    pub content_id: String,
    pub content_name: String,
    pub content_type: ContentType,
    pub reproductions: u64,
    pub last_reproduction: Option<DateTime<Utc>>,
    pub program_id: String,
    pub program_name: String,
    pub total_time: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsExport<'a> {
    stats: &'a BTreeMap<String, TelemetryRecord>,
    session_start: DateTime<Utc>,
    export_date: DateTime<Utc>,
}

struct TelemetryState {
    records: BTreeMap<String, TelemetryRecord>,
    session_start: DateTime<Utc>,
}

pub struct ReproductionTelemetry {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<TelemetryState>,
}

impl ReproductionTelemetry {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let records = load_records(store.as_ref());
        let session_start = clock.now();
        Self {
            store,
            clock,
            state: Mutex::new(TelemetryState {
                records,
                session_start,
            }),
        }
    }

    /// Upserts the record and sets its count to `exact_count`.
    pub fn sync_reproduction_count(
        &self,
        source: &PlaySource<'_>,
        exact_count: u64,
        duration: Option<f64>,
    ) {
        self.apply(source, duration, |record| record.reproductions = exact_count);
    }

    /// Increments the count by one. Not used by the scheduler loop.
    pub fn record_reproduction(&self, source: &PlaySource<'_>, duration: Option<f64>) {
        self.apply(source, duration, |record| record.reproductions += 1);
    }

    fn apply(
        &self,
        source: &PlaySource<'_>,
        duration: Option<f64>,
        update_count: impl FnOnce(&mut TelemetryRecord),
    ) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let session_start = state.session_start;

        let record = state
            .records
            .entry(source.content_id.to_string())
            .or_insert_with(|| TelemetryRecord {
                name: source.content_name.to_string(),
                content_type: source.content_type,
                reproductions: 0,
                last_reproduction: None,
                program_id: source.program_id.to_string(),
                program_name: source.program_name.to_string(),
                reproductions_per_minute: 0.0,
                total_duration: 0.0,
                average_session_time: 0.0,
            });

        record.name = source.content_name.to_string();
        record.content_type = source.content_type;
        record.program_id = source.program_id.to_string();
        record.program_name = source.program_name.to_string();

        update_count(record);
        record.last_reproduction = Some(now);

        if let Some(secs) = duration.filter(|d| *d > 0.0) {
            record.total_duration += secs;
            if record.reproductions > 0 {
                record.average_session_time = record.total_duration / record.reproductions as f64;
            }
        }

        if let Some(rate) = per_minute(record.reproductions, session_start, now) {
            record.reproductions_per_minute = rate;
        }

        self.persist(&state.records);
    }

    pub fn get_stats(&self) -> BTreeMap<String, TelemetryRecord> {
        self.state.lock().records.clone()
    }

    pub fn get_stats_by_program(&self, program_id: &str) -> BTreeMap<String, TelemetryRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|(_, r)| r.program_id == program_id)
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect()
    }

    pub fn get_global_stats(&self) -> GlobalStats {
        let now = self.clock.now();
        let state = self.state.lock();

        let total_reproductions: u64 = state.records.values().map(|r| r.reproductions).sum();
        let programs: HashSet<&str> = state
            .records
            .values()
            .map(|r| r.program_id.as_str())
            .collect();

        GlobalStats {
            total_programs: programs.len(),
            total_content: state.records.len(),
            total_reproductions,
            session_duration: whole_minutes(state.session_start, now),
            reproductions_per_minute: per_minute(total_reproductions, state.session_start, now)
                .unwrap_or(0.0),
            top_content: top_content(&state.records, TOP_CONTENT_LIMIT),
            last_updated: now,
        }
    }

    pub fn get_top_content(&self, limit: usize) -> Vec<TopContent> {
        top_content(&self.state.lock().records, limit)
    }

    pub fn get_total_reproductions(&self) -> u64 {
        self.state
            .lock()
            .records
            .values()
            .map(|r| r.reproductions)
            .sum()
    }

    /// Whole minutes since the session started.
    pub fn get_session_duration(&self) -> u64 {
        whole_minutes(self.state.lock().session_start, self.clock.now())
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.state.lock().session_start
    }

    pub fn all_stats(&self) -> Vec<TelemetryRow> {
        self.state
            .lock()
            .records
            .iter()
            .map(|(id, r)| TelemetryRow {
                content_id: id.clone(),
                content_name: r.name.clone(),
                content_type: r.content_type,
                reproductions: r.reproductions,
                last_reproduction: r.last_reproduction,
                program_id: r.program_id.clone(),
                program_name: r.program_name.clone(),
                total_time: r.total_duration,
            })
            .collect()
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        self.persist(&state.records);
        tracing::info!("Reproduction statistics cleared");
    }

    pub fn clear_content_stats(&self, content_id: &str) {
        let mut state = self.state.lock();
        if state.records.remove(content_id).is_some() {
            self.persist(&state.records);
        }
    }

    /// Restarts the session clock. Per-minute rates restart from zero.
    pub fn reset_session_stats(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.session_start = now;
        for record in state.records.values_mut() {
            record.reproductions_per_minute = 0.0;
        }
    }

    pub fn export_stats(&self) -> serde_json::Result<String> {
        let state = self.state.lock();
        serde_json::to_string_pretty(&StatsExport {
            stats: &state.records,
            session_start: state.session_start,
            export_date: self.clock.now(),
        })
    }

    /// Replaces all records (and the session start, when present). Returns
    /// false, leaving state untouched, when `stats` is not an object of
    /// telemetry records.
    pub fn import_stats(&self, data: &str) -> bool {
        let parsed: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Error importing stats: {}", e);
                return false;
            }
        };

        let Some(stats) = parsed.get("stats").filter(|s| s.is_object()) else {
            tracing::error!("Error importing stats: missing stats object");
            return false;
        };

        let records: BTreeMap<String, TelemetryRecord> = match serde_json::from_value(stats.clone())
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Error importing stats: {}", e);
                return false;
            }
        };

        let session_start = parsed
            .get("sessionStart")
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());

        let mut state = self.state.lock();
        state.records = records;
        if let Some(start) = session_start {
            state.session_start = start;
        }
        self.persist(&state.records);
        tracing::info!("Imported stats for {} content item(s)", state.records.len());
        true
    }

    pub fn save(&self) {
        let state = self.state.lock();
        self.persist(&state.records);
    }

    /// Periodically persists the records until `cancel` fires, then flushes
    /// once more.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let telemetry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(period);
            // The first tick completes immediately
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        tracing::debug!("Autosaving reproduction statistics");
                        telemetry.save();
                    }
                }
            }

            telemetry.save();
        })
    }

    fn persist(&self, records: &BTreeMap<String, TelemetryRecord>) {
        let result = serde_json::to_string(records)
            .map_err(crate::error::StoreError::from)
            .and_then(|json| self.store.set(REPRODUCTION_STATS_KEY, &json));
        if let Err(e) = result {
            tracing::error!("Error saving reproduction stats: {}", e);
        }
    }
}

fn load_records(store: &dyn KeyValueStore) -> BTreeMap<String, TelemetryRecord> {
    match store.get(REPRODUCTION_STATS_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::error!("Error loading reproduction stats: {}", e);
            BTreeMap::new()
        }),
        Ok(None) => BTreeMap::new(),
        Err(e) => {
            tracing::error!("Error loading reproduction stats: {}", e);
            BTreeMap::new()
        }
    }
}

fn top_content(records: &BTreeMap<String, TelemetryRecord>, limit: usize) -> Vec<TopContent> {
    let mut top: Vec<TopContent> = records
        .iter()
        .map(|(id, r)| TopContent {
            id: id.clone(),
            name: r.name.clone(),
            reproductions: r.reproductions,
            content_type: r.content_type,
        })
        .collect();
    top.sort_by(|a, b| b.reproductions.cmp(&a.reproductions));
    top.truncate(limit);
    top
}

fn whole_minutes(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start).num_minutes().max(0) as u64
}

/// Rate over the session so far, rounded to two decimals. `None` before any
/// time has elapsed.
fn per_minute(count: u64, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<f64> {
    let minutes = (now - start).num_milliseconds() as f64 / 60_000.0;
    if minutes > 0.0 {
        Some(((count as f64 / minutes) * 100.0).round() / 100.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv_store::MemoryStore;
    use crate::models::fixtures::{content, program, zone};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<ReproductionTelemetry>, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let telemetry = Arc::new(ReproductionTelemetry::new(store.clone(), clock.clone()));
        (telemetry, store, clock)
    }

    fn sample_program() -> Program {
        program(
            "p1",
            vec![zone(
                "z1",
                vec![
                    content("img", ContentType::Image),
                    content("vid", ContentType::Video),
                ],
            )],
        )
    }

    #[test]
    fn test_sync_sets_exact_count() {
        let (telemetry, _, clock) = setup();
        let program = sample_program();
        let img = &program.zones[0].content[0];
        let source = PlaySource::new(&program, img);

        clock.advance(chrono::Duration::minutes(2));
        telemetry.sync_reproduction_count(&source, 3, Some(8.0));
        telemetry.sync_reproduction_count(&source, 4, Some(8.0));

        let stats = telemetry.get_stats();
        let record = &stats["img"];
        assert_eq!(record.reproductions, 4);
        assert_eq!(record.total_duration, 16.0);
        assert_eq!(record.average_session_time, 4.0);
        assert_eq!(record.reproductions_per_minute, 2.0);
        assert_eq!(record.last_reproduction, Some(clock.now()));
        assert_eq!(record.program_name, "Program p1");
    }

    #[test]
    fn test_record_reproduction_increments() {
        let (telemetry, _, clock) = setup();
        let program = sample_program();
        let vid = &program.zones[0].content[1];
        let source = PlaySource::new(&program, vid);

        telemetry.record_reproduction(&source, None);
        telemetry.record_reproduction(&source, Some(15.0));
        clock.advance(chrono::Duration::minutes(1));
        telemetry.record_reproduction(&source, Some(15.0));

        let record = &telemetry.get_stats()["vid"];
        assert_eq!(record.reproductions, 3);
        assert_eq!(record.total_duration, 30.0);
        assert_eq!(record.average_session_time, 10.0);
        assert_eq!(record.reproductions_per_minute, 3.0);
    }

    #[test]
    fn test_program_context_last_writer_wins() {
        let (telemetry, _, _) = setup();
        let first = sample_program();
        let mut second = sample_program();
        second.id = "p2".into();
        second.name = "Lobby".into();

        let img = first.zones[0].content[0].clone();
        telemetry.sync_reproduction_count(&PlaySource::new(&first, &img), 1, None);
        telemetry.sync_reproduction_count(&PlaySource::new(&second, &img), 2, None);

        let record = &telemetry.get_stats()["img"];
        assert_eq!(record.program_id, "p2");
        assert_eq!(record.program_name, "Lobby");
        assert!(telemetry.get_stats_by_program("p1").is_empty());
        assert_eq!(telemetry.get_stats_by_program("p2").len(), 1);
    }

    #[test]
    fn test_global_stats_counts_distinct_programs() {
        let (telemetry, _, clock) = setup();
        let first = sample_program();
        let mut second = sample_program();
        second.id = "p2".into();

        let img = first.zones[0].content[0].clone();
        let vid = first.zones[0].content[1].clone();
        telemetry.sync_reproduction_count(&PlaySource::new(&first, &img), 6, None);
        telemetry.sync_reproduction_count(&PlaySource::new(&second, &vid), 2, None);
        clock.advance(chrono::Duration::minutes(4));

        let global = telemetry.get_global_stats();
        assert_eq!(global.total_programs, 2);
        assert_eq!(global.total_content, 2);
        assert_eq!(global.total_reproductions, 8);
        assert_eq!(global.session_duration, 4);
        assert_eq!(global.reproductions_per_minute, 2.0);
        assert_eq!(global.top_content[0].id, "img");
        assert_eq!(global.top_content[1].id, "vid");
        assert_eq!(telemetry.get_total_reproductions(), 8);
    }

    #[test]
    fn test_top_content_is_limited() {
        let (telemetry, _, _) = setup();
        let program = sample_program();
        for i in 0..8u64 {
            let mut item = content(&format!("c{}", i), ContentType::Image);
            item.name = format!("Item {}", i);
            telemetry.sync_reproduction_count(&PlaySource::new(&program, &item), i, None);
        }
        let top = telemetry.get_top_content(TOP_CONTENT_LIMIT);
        assert_eq!(top.len(), 5);
        assert_eq!(top[0].reproductions, 7);
        assert_eq!(top[4].reproductions, 3);
    }

    #[test]
    fn test_reset_session_zeroes_rates() {
        let (telemetry, _, clock) = setup();
        let program = sample_program();
        let img = &program.zones[0].content[0];
        clock.advance(chrono::Duration::minutes(1));
        telemetry.sync_reproduction_count(&PlaySource::new(&program, img), 5, None);
        assert_eq!(telemetry.get_stats()["img"].reproductions_per_minute, 5.0);

        telemetry.reset_session_stats();
        assert_eq!(telemetry.session_start(), clock.now());
        assert_eq!(telemetry.get_stats()["img"].reproductions_per_minute, 0.0);
        assert_eq!(telemetry.get_session_duration(), 0);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let (telemetry, _, clock) = setup();
        let program = sample_program();
        clock.advance(chrono::Duration::minutes(3));
        for (i, item) in program.zones[0].content.iter().enumerate() {
            let source = PlaySource::new(&program, item);
            telemetry.sync_reproduction_count(&source, (i + 1) as u64, Some(15.0));
        }
        let before = telemetry.get_stats();
        let exported = telemetry.export_stats().unwrap();

        telemetry.reset_stats();
        assert!(telemetry.get_stats().is_empty());

        assert!(telemetry.import_stats(&exported));
        assert_eq!(telemetry.get_stats(), before);

        let (other, _, _) = setup();
        assert!(other.import_stats(&exported));
        assert_eq!(other.get_stats(), before);
        assert_eq!(other.session_start(), telemetry.session_start());
    }

    #[test]
    fn test_import_rejects_malformed() {
        let (telemetry, _, _) = setup();
        let program = sample_program();
        let img = &program.zones[0].content[0];
        telemetry.sync_reproduction_count(&PlaySource::new(&program, img), 1, None);

        assert!(!telemetry.import_stats("{"));
        assert!(!telemetry.import_stats(r#"{"stats": [1, 2]}"#));
        assert!(!telemetry.import_stats(r#"{"other": {}}"#));
        assert!(!telemetry.import_stats(r#"{"stats": {"x": {"name": 1}}}"#));
        assert_eq!(telemetry.get_stats().len(), 1);
    }

    #[test]
    fn test_records_survive_reload() {
        let (telemetry, store, clock) = setup();
        let program = sample_program();
        let img = &program.zones[0].content[0];
        telemetry.sync_reproduction_count(&PlaySource::new(&program, img), 2, None);

        let reloaded = ReproductionTelemetry::new(store, clock);
        assert_eq!(reloaded.get_stats()["img"].reproductions, 2);
    }

    #[test]
    fn test_clear_content_stats() {
        let (telemetry, _, _) = setup();
        let program = sample_program();
        for item in &program.zones[0].content {
            telemetry.record_reproduction(&PlaySource::new(&program, item), None);
        }
        telemetry.clear_content_stats("img");
        let stats = telemetry.get_stats();
        assert!(!stats.contains_key("img"));
        assert!(stats.contains_key("vid"));
        assert_eq!(telemetry.all_stats().len(), 1);
    }

    struct CountingStore {
        inner: MemoryStore,
        writes: AtomicUsize,
    }

    impl KeyValueStore for CountingStore {
        fn get(&self, key: &str) -> crate::error::Result<Option<String>> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> crate::error::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> crate::error::Result<()> {
            self.inner.remove(key)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_runs_on_interval_and_flushes_on_cancel() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            writes: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let telemetry = Arc::new(ReproductionTelemetry::new(store.clone(), clock));

        let cancel = CancellationToken::new();
        let handle = telemetry.spawn_autosave(Duration::from_secs(30), cancel.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    }
}
