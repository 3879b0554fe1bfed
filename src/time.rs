//! Frame pacing: wall-clock deltas plus periodic averages of [`FrameStats`].

use std::time::Instant;

use crate::renderer::FrameStats;

/// Averages over one reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    pub frames: u32,
    pub skipped: u32,
    pub avg_frame_ms: f32,
    pub max_frame_ms: f32,
    pub avg_cpu_ms: f32,
    pub last_frame_index: u64,
    pub cascade_splits: Vec<f32>,
}

#[derive(Debug, Default)]
struct StatsWindow {
    elapsed: f32,
    frames: u32,
    skipped: u32,
    frame_ms: f32,
    max_frame_ms: f32,
    cpu_ms: f32,
}

pub struct FrameClock {
    start: Instant,
    last: Instant,
    delta: f32,
    report_interval: f32,
    window: StatsWindow,
}

impl FrameClock {
    pub fn new(report_interval_seconds: f32) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            delta: 0.0,
            report_interval: report_interval_seconds.max(0.0),
            window: StatsWindow::default(),
        }
    }

    /// Advances to now and returns the seconds since the previous tick.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        self.delta = now.duration_since(self.last).as_secs_f32();
        self.last = now;
        self.delta
    }

    pub fn delta_seconds(&self) -> f32 {
        self.delta
    }

    pub fn elapsed_seconds(&self) -> f32 {
        self.last.duration_since(self.start).as_secs_f32()
    }

    /// Folds one frame's stats into the current window. Once `frame_time` has summed
    /// past the report interval the window closes and its averages are returned.
    pub fn record(&mut self, stats: &FrameStats) -> Option<FrameSummary> {
        let window = &mut self.window;
        window.elapsed += stats.frame_time.max(0.0);
        if stats.skipped {
            window.skipped += 1;
        } else {
            let frame_ms = stats.frame_time * 1000.0;
            window.frames += 1;
            window.frame_ms += frame_ms;
            window.max_frame_ms = window.max_frame_ms.max(frame_ms);
            window.cpu_ms += stats.cpu_time_ms;
        }
        if window.elapsed < self.report_interval {
            return None;
        }
        let closed = std::mem::take(window);
        let frames = closed.frames.max(1) as f32;
        Some(FrameSummary {
            frames: closed.frames,
            skipped: closed.skipped,
            avg_frame_ms: closed.frame_ms / frames,
            max_frame_ms: closed.max_frame_ms,
            avg_cpu_ms: closed.cpu_ms / frames,
            last_frame_index: stats.frame_index,
            cascade_splits: stats.cascade_splits.clone(),
        })
    }
}
