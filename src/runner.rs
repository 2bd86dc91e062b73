//! The consumer polling loop: observe `frame_ready`, run vision then brain,
//! raise `result_ready`, re-arm, and sleep out the rest of the cadence.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::time::sleep;

use crate::brain::BrainEngine;
use crate::shm::SharedRegion;
use crate::types::{ActionCommand, ActionKind, GameState};
use crate::vision::{VisionEngine, VisionError};

/// Polling cadence of the standalone loop.
pub const POLL_HZ: u64 = 100;

/// One polling period; the loop times its own iteration and sleeps the
/// remainder of this.
pub fn poll_period() -> Duration {
    Duration::from_nanos(1_000_000_000 / POLL_HZ)
}

/// One processed frame, as printed by the standalone loop.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TickReport {
    pub frame_number: u64,
    pub vision_us: i64,
    pub brain_us: i64,
    pub total_us: i64,
    pub state: GameState,
}

#[derive(Serialize)]
struct ActionLogEntry {
    timestamp: String,
    frame_number: u64,
    kind: ActionKind,
    x: i32,
    y: i32,
    duration_ms: i32,
    state: GameState,
}

/// Owns the shared region and both engines, and drives them once per
/// published frame.
pub struct Runner {
    region: SharedRegion,
    vision: VisionEngine,
    brain: BrainEngine,
    action_log: Option<PathBuf>,
}

impl Runner {
    pub fn new(region: SharedRegion, vision: VisionEngine, brain: BrainEngine) -> Self {
        Self { region, vision, brain, action_log: None }
    }

    /// Append one JSON line per emitted action to this file.
    pub fn set_action_log(&mut self, path: impl Into<PathBuf>) {
        self.action_log = Some(path.into());
    }

    pub fn vision_mut(&mut self) -> &mut VisionEngine {
        &mut self.vision
    }

    pub fn brain_mut(&mut self) -> &mut BrainEngine {
        &mut self.brain
    }

    /// One polled iteration. Returns `Ok(None)` when no frame is waiting;
    /// otherwise runs vision and brain, publishes the results, clears
    /// `frame_ready`, and reports the frame's latencies.
    pub fn tick(&mut self) -> Result<Option<TickReport>, VisionError> {
        let (report, emitted) = {
            let (header, frame) = self.region.split_mut();
            if !header.frame_ready() {
                return Ok(None);
            }

            self.vision.process_frame(header, frame)?;
            self.brain.process(header);
            header.clear_frame_ready();

            let report = TickReport {
                frame_number: header.frame_number,
                vision_us: header.vision_latency_ns / 1000,
                brain_us: header.brain_latency_ns / 1000,
                total_us: header.total_latency_ns / 1000,
                state: header.state(),
            };
            // ACTION_PENDING is only ever held for the tick that entered
            // it, so seeing it here means the pending action is fresh.
            let emitted = (report.state == GameState::ActionPending
                && header.pending_action.kind != ActionKind::None)
                .then(|| header.pending_action);
            (report, emitted)
        };

        if let Some(action) = emitted {
            self.log_action(report.frame_number, &action, report.state);
        }
        Ok(Some(report))
    }

    /// Poll at [`POLL_HZ`] until the task is cancelled. Per-tick failures
    /// are logged and the loop keeps going.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("processing loop started ({POLL_HZ} Hz)");
        let period = poll_period();

        loop {
            let started = Instant::now();

            match self.tick() {
                Ok(Some(report)) => {
                    println!(
                        "Frame {}: Vision={}us Brain={}us Total={}us State={}",
                        report.frame_number,
                        report.vision_us,
                        report.brain_us,
                        report.total_us,
                        report.state,
                    );
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("tick failed: {e}"),
            }

            let elapsed = started.elapsed();
            if elapsed < period {
                sleep(period - elapsed).await;
            }
        }
    }

    fn log_action(&self, frame_number: u64, action: &ActionCommand, state: GameState) {
        use std::fs::OpenOptions;
        use std::io::Write;

        let Some(path) = &self.action_log else {
            return;
        };

        let entry = ActionLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            frame_number,
            kind: action.kind,
            x: action.start.x,
            y: action.start.y,
            duration_ms: action.duration_ms,
            state,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("failed to serialize action log entry: {e}");
                return;
            }
        };

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    tracing::warn!("failed to write to {}: {e}", path.display());
                }
            }
            Err(e) => {
                tracing::warn!("failed to open {}: {e}", path.display());
            }
        }
    }
}
