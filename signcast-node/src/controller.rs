use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::PlaybackError;
use crate::models::Program;
use crate::scheduler::{PlaybackEvent, PlaybackScheduler, TickOutcome, ZoneState};

pub const DEFAULT_PLAYBACK_SPEED: Duration = Duration::from_millis(8000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub active_programs: usize,
    pub active_zones: usize,
    /// Tick interval in milliseconds.
    pub playback_speed: u64,
    pub total_content: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZonePlaybackStats {
    pub zone_id: String,
    pub zone_name: String,
    pub current_content: Option<String>,
    pub total_content: usize,
    pub available_content: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramPlaybackStats {
    pub program_id: String,
    pub program_name: String,
    pub zones: Vec<ZonePlaybackStats>,
}

struct ControllerState {
    programs: Vec<Arc<Program>>,
    is_running: bool,
    playback_speed: Duration,
}

/// Owns the active program set and the global running flag, and drives the
/// scheduler's task registry from them.
pub struct SchedulerController {
    scheduler: PlaybackScheduler,
    state: Mutex<ControllerState>,
}

impl SchedulerController {
    pub fn new(scheduler: PlaybackScheduler, playback_speed: Duration) -> Self {
        Self {
            scheduler,
            state: Mutex::new(ControllerState {
                programs: Vec::new(),
                is_running: false,
                playback_speed,
            }),
        }
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.scheduler.subscribe()
    }

    /// Replaces the full program set. Rotation begins when any zone has
    /// content, or is rebuilt if it was already running.
    pub fn initialize_with_programs(&self, programs: Vec<Program>) {
        let programs: Vec<Arc<Program>> = programs.into_iter().map(Arc::new).collect();
        let playable = programs.iter().any(|p| p.has_playable_zones());

        tracing::info!(
            "Initializing playback with {} program(s)",
            programs.len()
        );

        let should_start = {
            let mut state = self.state.lock();
            state.programs = programs;
            state.is_running || playable
        };

        if should_start {
            self.launch();
        } else {
            tracing::info!("No zone has content, playback stays idle");
            self.publish_status();
        }
    }

    /// Stop-all followed by a fresh initialize. Cursors reset.
    pub fn update_programs(&self, programs: Vec<Program>) {
        tracing::info!("Program set changed, rebuilding playback");
        self.halt();
        self.initialize_with_programs(programs);
    }

    pub fn start_global_playback(&self) {
        if self.state.lock().is_running {
            tracing::warn!("Playback is already running");
            return;
        }
        self.launch();
    }

    pub fn stop_global_playback(&self) {
        if !self.state.lock().is_running {
            tracing::warn!("Playback is already stopped");
            return;
        }
        self.halt();
        tracing::info!("Global playback stopped");
        self.publish_status();
    }

    /// Changes the global tick interval, rebuilding every timer if running.
    pub fn set_playback_speed(&self, speed: Duration) -> Result<(), PlaybackError> {
        if speed.is_zero() {
            return Err(PlaybackError::InvalidPlaybackSpeed);
        }

        let was_running = {
            let mut state = self.state.lock();
            state.playback_speed = speed;
            state.is_running
        };
        tracing::info!("Playback speed set to {:?}", speed);

        if was_running {
            self.halt();
            self.launch();
        } else {
            self.publish_status();
        }
        Ok(())
    }

    /// One out-of-band tick for a single zone. `None` when the zone is not
    /// part of the active program set.
    pub fn force_advance_content(&self, program_id: &str, zone_id: &str) -> Option<TickOutcome> {
        let program = self.find_program(program_id)?;
        let zone = program.zone(zone_id)?;
        tracing::info!("Forcing advance in zone \"{}\" ({})", zone.name, program.name);
        Some(self.scheduler.advance_zone(&program, zone))
    }

    pub fn get_status(&self) -> SchedulerStatus {
        let state = self.state.lock();
        SchedulerStatus {
            is_running: state.is_running,
            active_programs: state.programs.len(),
            active_zones: self.scheduler.active_zone_count(),
            playback_speed: u64::try_from(state.playback_speed.as_millis()).unwrap_or(u64::MAX),
            total_content: state.programs.iter().map(|p| p.content_count()).sum(),
        }
    }

    pub fn get_current_playback_stats(&self) -> Vec<ProgramPlaybackStats> {
        self.programs()
            .iter()
            .map(|program| ProgramPlaybackStats {
                program_id: program.id.clone(),
                program_name: program.name.clone(),
                zones: program
                    .zones
                    .iter()
                    .map(|zone| ZonePlaybackStats {
                        zone_id: zone.id.clone(),
                        zone_name: zone.name.clone(),
                        current_content: self
                            .scheduler
                            .current_content(program, zone)
                            .map(|c| c.name.clone()),
                        total_content: zone.content.len(),
                        available_content: self.scheduler.available_content(zone).len(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn programs(&self) -> Vec<Arc<Program>> {
        self.state.lock().programs.clone()
    }

    pub fn find_program(&self, program_id: &str) -> Option<Arc<Program>> {
        self.state
            .lock()
            .programs
            .iter()
            .find(|p| p.id == program_id)
            .cloned()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    pub fn playback_speed(&self) -> Duration {
        self.state.lock().playback_speed
    }

    pub fn zone_state(&self, program_id: &str, zone_id: &str) -> Option<ZoneState> {
        self.scheduler.zone_state(program_id, zone_id)
    }

    fn launch(&self) {
        let (programs, speed) = {
            let mut state = self.state.lock();
            state.is_running = true;
            (state.programs.clone(), state.playback_speed)
        };

        self.scheduler.start(&programs, speed);
        self.scheduler.register_initial_playbacks(&programs);

        tracing::info!(
            "Global playback started: {} zone(s) every {:?}",
            self.scheduler.active_zone_count(),
            speed
        );
        self.publish_status();
    }

    fn halt(&self) {
        self.state.lock().is_running = false;
        let stopped = self.scheduler.stop_all();
        tracing::debug!("Stopped {} zone task(s)", stopped);
    }

    fn publish_status(&self) {
        self.scheduler.publish(PlaybackEvent::StatusChanged {
            status: self.get_status(),
        });
    }
}
