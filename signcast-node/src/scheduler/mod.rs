//! Per-zone content rotation.
//!
//! Every (program, zone) pair with content gets its own repeating task. A
//! tick filters the zone's playlist through the repetition ledger, advances
//! the zone cursor over the eligible subset and records the play in both the
//! ledger and telemetry. The cursor indexes the eligible subset, not the full
//! playlist, so items dropping in or out of eligibility shift the rotation.


use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::controller::SchedulerStatus;
use crate::models::{Content, Program, Zone};
use crate::repetition::RepetitionLedger;
use crate::telemetry::{PlaySource, ReproductionTelemetry};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ZoneKey {
    pub program_id: String,
    pub zone_id: String,
}

impl ZoneKey {
    pub fn new(program_id: &str, zone_id: &str) -> Self {
        Self {
            program_id: program_id.to_string(),
            zone_id: zone_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ZoneState {
    /// Zone has no content; no task runs for it.
    Idle,
    Rotating,
    /// Task still runs, but the last tick found nothing eligible.
    Exhausted,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybackEvent {
    ContentPlayed {
        program_id: String,
        zone_id: String,
        content_id: String,
        content_name: String,
        reproductions_today: u32,
        initial: bool,
    },
    /// Non-media content took its turn; nothing is counted for it.
    ContentSkipped {
        program_id: String,
        zone_id: String,
        content_id: String,
    },
    ZoneExhausted {
        program_id: String,
        zone_id: String,
    },
    StatusChanged {
        status: SchedulerStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Played {
        content_id: String,
        index: usize,
        reproductions_today: u32,
    },
    Shown {
        content_id: String,
        index: usize,
    },
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct ZoneSlot {
    cursor: usize,
    state: ZoneState,
}

impl ZoneSlot {
    fn fresh(state: ZoneState) -> Self {
        Self { cursor: 0, state }
    }
}

#[derive(Clone)]
pub struct PlaybackScheduler {
    ledger: Arc<RepetitionLedger>,
    telemetry: Arc<ReproductionTelemetry>,
    events: broadcast::Sender<PlaybackEvent>,
    slots: Arc<Mutex<HashMap<ZoneKey, ZoneSlot>>>,
    tasks: Arc<Mutex<HashMap<ZoneKey, CancellationToken>>>,
    // Held for a whole tick: eligibility, cursor, record, read-back, sync.
    // Zones sharing a content id share one quota.
    tick_lock: Arc<Mutex<()>>,
}

impl PlaybackScheduler {
    pub fn new(ledger: Arc<RepetitionLedger>, telemetry: Arc<ReproductionTelemetry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ledger,
            telemetry,
            events,
            slots: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            tick_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Having no subscribers is not an error.
    pub fn publish(&self, event: PlaybackEvent) {
        let _ = self.events.send(event);
    }

    /// Rebuilds the task set: one rotation task per zone with content, all
    /// cursors back at 0. Must be called from within a Tokio runtime.
    pub fn start(&self, programs: &[Arc<Program>], period: Duration) {
        let mut tasks = self.tasks.lock();
        let mut slots = self.slots.lock();

        for (_, token) in tasks.drain() {
            token.cancel();
        }
        slots.clear();

        for program in programs {
            for (zone_idx, zone) in program.zones.iter().enumerate() {
                let key = ZoneKey::new(&program.id, &zone.id);

                if zone.content.is_empty() {
                    slots.insert(key, ZoneSlot::fresh(ZoneState::Idle));
                    continue;
                }

                slots.insert(key.clone(), ZoneSlot::fresh(ZoneState::Rotating));

                let cancel = CancellationToken::new();
                if let Some(previous) = tasks.insert(key, cancel.clone()) {
                    tracing::warn!(
                        "Duplicate zone id \"{}\" in program \"{}\", replacing its task",
                        zone.id,
                        program.name
                    );
                    previous.cancel();
                }

                tokio::spawn(rotate_zone(
                    self.clone(),
                    Arc::clone(program),
                    zone_idx,
                    period,
                    cancel,
                ));

                tracing::info!(
                    "Zone \"{}\" of program \"{}\" rotating every {:?}",
                    zone.name,
                    program.name,
                    period
                );
            }
        }
    }

    /// Cancels every rotation task. A tick already executing finishes.
    pub fn stop_all(&self) -> usize {
        let mut tasks = self.tasks.lock();
        let stopped = tasks.len();
        for (_, token) in tasks.drain() {
            token.cancel();
        }

        let mut slots = self.slots.lock();
        for slot in slots.values_mut() {
            *slot = ZoneSlot::fresh(ZoneState::Stopped);
        }
        stopped
    }

    pub fn active_zone_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn zone_state(&self, program_id: &str, zone_id: &str) -> Option<ZoneState> {
        self.slots
            .lock()
            .get(&ZoneKey::new(program_id, zone_id))
            .map(|s| s.state)
    }

    pub fn cursor(&self, program_id: &str, zone_id: &str) -> Option<usize> {
        self.slots
            .lock()
            .get(&ZoneKey::new(program_id, zone_id))
            .map(|s| s.cursor)
    }

    /// Content passing today's limit check. Uses the side-effect free ledger
    /// view, so it is safe for status reporting.
    pub fn available_content<'a>(&self, zone: &'a Zone) -> Vec<&'a Content> {
        zone.content
            .iter()
            .filter(|c| self.ledger.get_playback_info(&c.id).can_play)
            .collect()
    }

    /// Item under the zone cursor, if any is eligible.
    pub fn current_content<'a>(&self, program: &Program, zone: &'a Zone) -> Option<&'a Content> {
        let cursor = self.cursor(&program.id, &zone.id).unwrap_or(0);
        self.available_content(zone).get(cursor).copied()
    }

    /// One tick for one zone.
    pub fn advance_zone(&self, program: &Program, zone: &Zone) -> TickOutcome {
        let _tick = self.tick_lock.lock();

        let eligible: Vec<&Content> = zone
            .content
            .iter()
            .filter(|c| self.ledger.can_play_today(&c.id))
            .collect();

        let key = ZoneKey::new(&program.id, &zone.id);

        if eligible.is_empty() {
            if let Some(slot) = self.slots.lock().get_mut(&key) {
                if slot.state == ZoneState::Rotating {
                    slot.state = ZoneState::Exhausted;
                }
            }
            tracing::debug!(
                "No content available in zone \"{}\" ({})",
                zone.name,
                program.name
            );
            self.publish(PlaybackEvent::ZoneExhausted {
                program_id: program.id.clone(),
                zone_id: zone.id.clone(),
            });
            return TickOutcome::Exhausted;
        }

        let index = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry(key)
                .or_insert_with(|| ZoneSlot::fresh(ZoneState::Rotating));
            slot.cursor = (slot.cursor + 1) % eligible.len();
            if slot.state == ZoneState::Exhausted {
                slot.state = ZoneState::Rotating;
            }
            slot.cursor
        };

        self.play(program, zone, eligible[index], index, false)
    }

    /// Plays the first eligible item of every zone so a freshly started
    /// display is not blank for a whole tick. Cursors are left untouched.
    pub fn register_initial_playbacks(&self, programs: &[Arc<Program>]) -> usize {
        tracing::info!("Registering initial playbacks");
        let mut played = 0;

        for program in programs {
            for zone in &program.zones {
                let _tick = self.tick_lock.lock();
                let first = zone
                    .content
                    .iter()
                    .find(|c| self.ledger.can_play_today(&c.id));

                if let Some(content) = first {
                    if let TickOutcome::Played { .. } = self.play(program, zone, content, 0, true) {
                        played += 1;
                    }
                }
            }
        }
        played
    }

    fn play(
        &self,
        program: &Program,
        zone: &Zone,
        content: &Content,
        index: usize,
        initial: bool,
    ) -> TickOutcome {
        if !content.content_type.is_playable_media() {
            self.publish(PlaybackEvent::ContentSkipped {
                program_id: program.id.clone(),
                zone_id: zone.id.clone(),
                content_id: content.id.clone(),
            });
            return TickOutcome::Shown {
                content_id: content.id.clone(),
                index,
            };
        }

        self.ledger.record_playback(&content.id);

        // Telemetry mirrors the stored count for today, never an increment
        let reproductions_today = self
            .ledger
            .get_content_stats(&content.id)
            .map(|s| s.reproductions_today)
            .unwrap_or(1);

        self.telemetry.sync_reproduction_count(
            &PlaySource::new(program, content),
            u64::from(reproductions_today),
            Some(content.content_type.nominal_play_secs()),
        );

        tracing::info!(
            "{} #{} recorded: \"{}\" in \"{}\" ({})",
            if initial { "Initial playback" } else { "Playback" },
            reproductions_today,
            content.name,
            zone.name,
            program.name
        );

        self.publish(PlaybackEvent::ContentPlayed {
            program_id: program.id.clone(),
            zone_id: zone.id.clone(),
            content_id: content.id.clone(),
            content_name: content.name.clone(),
            reproductions_today,
            initial,
        });

        TickOutcome::Played {
            content_id: content.id.clone(),
            index,
            reproductions_today,
        }
    }
}

async fn rotate_zone(
    scheduler: PlaybackScheduler,
    program: Arc<Program>,
    zone_idx: usize,
    period: Duration,
    cancel: CancellationToken,
) {
    let zone = &program.zones[zone_idx];

    // Like a repeating timer: the first tick fires one period after start.
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                scheduler.advance_zone(&program, zone);
            }
        }
    }

    tracing::debug!(
        "Rotation stopped for zone \"{}\" ({})",
        zone.name,
        program.name
    );
}
