//! Continuous Ambilight sampling
//!
//! The engine owns two cells, the active calibration and the last result,
//! each replaced wholesale through an atomic pointer swap. HTTP handlers read
//! and replace the calibration while the blocking sampling loop reads it once
//! per cycle, so a cycle always works from one consistent snapshot and readers
//! never observe colors paired with rects from another cycle.

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::calibration::{AmbilightConfig, CalibrationError, CalibrationRequest, WorkingSpace};
use crate::color::{average_colors, sample_color, AveragingPolicy, RgbColor};
use crate::frame::{CaptureError, FrameLease, FrameSource, PixelBuffer};
use crate::geometry::{DepthPolicy, WindowRect};

/// Minimum spacing between repeated frame acquisition warnings
const ACQUIRE_WARN_INTERVAL: Duration = Duration::from_secs(10);

/// Colors of one sampling cycle, index-matched with the rects they came from
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbilightResult {
    pub top: Vec<RgbColor>,
    pub bottom: Vec<RgbColor>,
    pub left: Vec<RgbColor>,
    pub right: Vec<RgbColor>,
    pub top_rects: Vec<WindowRect>,
    pub bottom_rects: Vec<WindowRect>,
    pub left_rects: Vec<WindowRect>,
    pub right_rects: Vec<WindowRect>,
    /// Milliseconds since the engine started
    pub timestamp: u64,
    #[serde(skip)]
    pub valid: bool,
}

impl AmbilightResult {
    /// All colors in ring order: top, right, bottom reversed, left reversed
    pub fn ring(&self) -> Vec<RgbColor> {
        self.top
            .iter()
            .chain(&self.right)
            .chain(self.bottom.iter().rev())
            .chain(self.left.iter().rev())
            .copied()
            .collect()
    }

    pub fn window_count(&self) -> usize {
        self.top.len() + self.bottom.len() + self.left.len() + self.right.len()
    }
}

/// What a single cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Calibration invalid, nothing sampled
    Idle,
    /// New result published
    Sampled,
    /// No frame this cycle, previous result kept
    Stale,
}

/// Calibration and result state shared between the loop and the HTTP API
pub struct SamplingEngine {
    config: ArcSwap<AmbilightConfig>,
    result: ArcSwap<AmbilightResult>,
    /// Calibration restored by `reset`
    defaults: AmbilightConfig,
    space: WorkingSpace,
    default_depth: DepthPolicy,
    started: Instant,
    last_acquire_warning: Mutex<Option<Instant>>,
    running: AtomicBool,
}

impl SamplingEngine {
    pub fn new(defaults: AmbilightConfig, space: WorkingSpace) -> Self {
        let default_depth = defaults.depth;
        Self {
            config: ArcSwap::from_pointee(defaults.clone()),
            result: ArcSwap::from_pointee(AmbilightResult::default()),
            defaults,
            space,
            default_depth,
            started: Instant::now(),
            last_acquire_warning: Mutex::new(None),
            running: AtomicBool::new(true),
        }
    }

    /// Snapshot of the active calibration
    pub fn config(&self) -> Arc<AmbilightConfig> {
        self.config.load_full()
    }

    /// Snapshot of the last published result
    pub fn result(&self) -> Arc<AmbilightResult> {
        self.result.load_full()
    }

    pub fn space(&self) -> &WorkingSpace {
        &self.space
    }

    /// Apply a calibration update payload
    ///
    /// A rejected payload still replaces the calibration: the previous
    /// geometry is kept but marked invalid, which idles the loop until a
    /// good update arrives.
    pub fn apply_update(&self, body: &[u8]) -> Result<(), CalibrationError> {
        let current = self.config.load_full();

        match CalibrationRequest::parse(body).and_then(CalibrationRequest::validate) {
            Ok(request) => {
                let next = current.with_request(&request, &self.space, self.default_depth);
                info!(
                    "Calibration updated: {}x{} segments, depth {:?}",
                    next.counts.horizontal, next.counts.vertical, next.depth
                );
                self.config.store(Arc::new(next));
                Ok(())
            }
            Err(e) => {
                warn!("Rejected calibration update: {}", e);
                self.config.store(Arc::new(current.invalidated()));
                Err(e)
            }
        }
    }

    /// Restore the startup calibration
    pub fn reset(&self) {
        info!("Calibration reset to startup defaults");
        self.config.store(Arc::new(self.defaults.clone()));
    }

    /// Ask the sampling loop to return after its current cycle
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn timestamp_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run one sampling cycle against `source`
    pub fn run_cycle(&self, source: &mut dyn FrameSource) -> CycleOutcome {
        let config = self.config.load_full();

        if !config.valid {
            if self.result.load().valid {
                self.result.store(Arc::new(AmbilightResult::default()));
            }
            return CycleOutcome::Idle;
        }

        let windows = config.windows();

        let lease = match FrameLease::acquire(source) {
            Ok(lease) => lease,
            Err(e) => {
                self.note_acquire_failure(&e);
                return CycleOutcome::Stale;
            }
        };

        let frame = lease.frame();
        let policy = config.averaging;
        let ((top, bottom), (left, right)) = rayon::join(
            || {
                rayon::join(
                    || sample_edge(frame, &windows.top, policy),
                    || sample_edge(frame, &windows.bottom, policy),
                )
            },
            || {
                rayon::join(
                    || sample_edge(frame, &windows.left, policy),
                    || sample_edge(frame, &windows.right, policy),
                )
            },
        );
        drop(lease);

        self.result.store(Arc::new(AmbilightResult {
            top,
            bottom,
            left,
            right,
            top_rects: windows.top,
            bottom_rects: windows.bottom,
            left_rects: windows.left,
            right_rects: windows.right,
            timestamp: self.timestamp_ms(),
            valid: true,
        }));

        CycleOutcome::Sampled
    }

    fn note_acquire_failure(&self, err: &CaptureError) {
        let mut last = self.last_acquire_warning.lock();
        let due = last.map_or(true, |at| at.elapsed() >= ACQUIRE_WARN_INTERVAL);
        if due {
            match err {
                CaptureError::Unavailable(_) => warn!("No frame available, keeping last result ({})", err),
                _ => warn!("Frame acquisition failed, keeping last result: {}", err),
            }
            *last = Some(Instant::now());
        } else {
            debug!("Frame acquisition failed: {}", err);
        }
    }
}

fn sample_edge(frame: &PixelBuffer, rects: &[WindowRect], policy: AveragingPolicy) -> Vec<RgbColor> {
    rects.iter().map(|rect| sample_color(frame, *rect, policy)).collect()
}

/// Drive the engine at a fixed cadence until [`SamplingEngine::shutdown`]
///
/// There is no retry or backoff: a failed cycle simply waits for the next tick.
pub fn run_sampling_loop(engine: Arc<SamplingEngine>, mut source: Box<dyn FrameSource>, cadence: Duration) -> Result<()> {
    info!("=== Ambilight Sampling Loop ===");
    info!("Source: {}", source.describe());
    info!("Cadence: {} ms ({:.1} Hz)", cadence.as_millis(), 1.0 / cadence.as_secs_f64().max(0.001));

    let mut sampled = 0u64;
    let mut stale = 0u64;
    let mut idle = 0u64;
    let mut last_stats_time = Instant::now();
    let stats_interval = Duration::from_secs(10);

    while engine.is_running() {
        let cycle_start = Instant::now();

        match engine.run_cycle(source.as_mut()) {
            CycleOutcome::Sampled => sampled += 1,
            CycleOutcome::Stale => stale += 1,
            CycleOutcome::Idle => idle += 1,
        }

        if last_stats_time.elapsed() >= stats_interval {
            let result = engine.result();
            let policy = engine.config().averaging;
            match average_colors(policy, &result.ring()) {
                Some(mean) => info!(
                    "Sampling: {} sampled, {} stale, {} idle in {:.1}s, {} windows, ring luma {}",
                    sampled,
                    stale,
                    idle,
                    last_stats_time.elapsed().as_secs_f64(),
                    result.window_count(),
                    mean.luma()
                ),
                None => info!(
                    "Sampling: {} sampled, {} stale, {} idle in {:.1}s, no result",
                    sampled,
                    stale,
                    idle,
                    last_stats_time.elapsed().as_secs_f64()
                ),
            }
            sampled = 0;
            stale = 0;
            idle = 0;
            last_stats_time = Instant::now();
        }

        if let Some(rest) = cadence.checked_sub(cycle_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    info!("Sampling loop stopped");
    Ok(())
}
