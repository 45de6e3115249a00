//! Operational debug surface. Only wired up when diagnostics are enabled in
//! the node config; holds explicit references instead of global lookups.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::controller::SchedulerController;
use crate::error::PlaybackError;
use crate::repetition::{RepetitionLedger, UNLIMITED};
use crate::scheduler::TickOutcome;
use crate::telemetry::{PlaySource, ReproductionTelemetry};

pub struct Diagnostics {
    controller: Arc<SchedulerController>,
    ledger: Arc<RepetitionLedger>,
    telemetry: Arc<ReproductionTelemetry>,
    monitor: Mutex<Option<CancellationToken>>,
}

impl Diagnostics {
    pub fn new(
        controller: Arc<SchedulerController>,
        ledger: Arc<RepetitionLedger>,
        telemetry: Arc<ReproductionTelemetry>,
    ) -> Self {
        Self {
            controller,
            ledger,
            telemetry,
            monitor: Mutex::new(None),
        }
    }

    /// Full dump: scheduler status, per-zone playback, ledger and telemetry.
    pub fn full_report(&self) -> String {
        let status = self.controller.get_status();
        let mut lines = vec![
            "=== Signcast statistics ===".to_string(),
            String::new(),
            "Scheduler:".to_string(),
            format!("  state: {}", running_label(status.is_running)),
            format!("  active programs: {}", status.active_programs),
            format!("  active zones: {}", status.active_zones),
            format!("  total content: {}", status.total_content),
            format!("  playback speed: {}ms", status.playback_speed),
            String::new(),
            "Current playback:".to_string(),
        ];

        for program in self.controller.get_current_playback_stats() {
            lines.push(format!("  program: {}", program.program_name));
            for zone in program.zones {
                lines.push(format!("    zone: {}", zone.zone_name));
                lines.push(format!(
                    "      current: {}",
                    zone.current_content.as_deref().unwrap_or("-")
                ));
                lines.push(format!(
                    "      content: {} total, {} available",
                    zone.total_content, zone.available_content
                ));
            }
        }

        lines.push(String::new());
        lines.push("Repetition limits:".to_string());
        let limits = self.ledger.all_stats();
        if limits.is_empty() {
            lines.push("  no repetition data".to_string());
        }
        for stat in limits {
            let limit = if stat.is_unlimited || stat.daily_limit == UNLIMITED {
                "unlimited".to_string()
            } else {
                stat.daily_limit.to_string()
            };
            lines.push(format!(
                "  {}: {} today, limit {}, can play: {}",
                stat.content_id,
                stat.reproductions_today,
                limit,
                if stat.can_play_today { "yes" } else { "no" }
            ));
        }

        lines.push(String::new());
        lines.push("Reproductions:".to_string());
        let rows = self.telemetry.all_stats();
        if rows.is_empty() {
            lines.push("  no reproduction data".to_string());
        }
        for row in rows {
            lines.push(format!(
                "  {} ({}, {}): {} play(s), last {}, {:.0}s total",
                row.content_name,
                row.content_id,
                row.content_type,
                row.reproductions,
                row.last_reproduction
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
                row.total_time
            ));
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// One-line-per-figure condensed status.
    pub fn system_status(&self) -> String {
        let status = self.controller.get_status();
        format!(
            "scheduler: {} | programs: {} | zones: {} | content: {} | repetition records: {} | reproduction records: {} | speed: {}ms",
            running_label(status.is_running),
            status.active_programs,
            status.active_zones,
            status.total_content,
            self.ledger.all_stats().len(),
            self.telemetry.all_stats().len(),
            status.playback_speed
        )
    }

    /// Counts one manual reproduction for whatever the first zone of the
    /// first program is showing. Returns the content id, if anything played.
    pub fn simulate_playback(&self) -> Option<String> {
        let programs = self.controller.programs();
        let Some(program) = programs.first() else {
            tracing::warn!("No programs available to simulate");
            return None;
        };
        let Some(zone) = program.zones.first() else {
            tracing::warn!("No zones available to simulate");
            return None;
        };
        let Some(content) = self.controller.scheduler().current_content(program, zone) else {
            tracing::warn!("Zone \"{}\" has no content to simulate", zone.name);
            return None;
        };

        self.telemetry.record_reproduction(
            &PlaySource::new(program, content),
            Some(content.content_type.nominal_play_secs()),
        );
        tracing::info!("Simulated playback of \"{}\"", content.name);
        Some(content.id.clone())
    }

    /// Logs the condensed status every `period`. Returns false if a monitor
    /// is already running.
    pub fn start_monitoring(self: &Arc<Self>, period: Duration) -> bool {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            tracing::warn!("Monitoring is already running");
            return false;
        }

        let cancel = CancellationToken::new();
        *monitor = Some(cancel.clone());

        let diagnostics = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        tracing::info!("{}", diagnostics.system_status());
                    }
                }
            }
        });

        tracing::info!("Monitoring started, reporting every {:?}", period);
        true
    }

    pub fn stop_monitoring(&self) -> bool {
        match self.monitor.lock().take() {
            Some(cancel) => {
                cancel.cancel();
                tracing::info!("Monitoring stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Wipes every repetition record and all telemetry.
    pub fn clear_all_stats(&self) {
        for stat in self.ledger.all_stats() {
            self.ledger.clear_content_data(&stat.content_id);
        }
        self.telemetry.reset_stats();
        tracing::info!("All statistics cleared");
    }

    pub fn set_playback_speed_secs(&self, secs: u64) -> Result<(), PlaybackError> {
        self.controller
            .set_playback_speed(Duration::from_secs(secs))
    }

    pub fn force_advance(&self, program_id: &str, zone_id: &str) -> Option<TickOutcome> {
        self.controller.force_advance_content(program_id, zone_id)
    }
}

fn running_label(running: bool) -> &'static str {
    if running {
        "running"
    } else {
        "stopped"
    }
}
