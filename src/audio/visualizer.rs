//! Visualizer sampler
//!
//! Tapped off the routing graph independently of recording state: the
//! level meter animates whenever the graph has a live input, armed or not.
//! Sample batches land in a bounded ring, get reduced to a 20-bucket
//! amplitude frame, smoothed, and published at roughly 30 fps.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::PipelineEvent;

/// Buckets per published frame.
pub const NUM_BUCKETS: usize = 20;

/// Ring capacity, ~200ms at 48kHz mono.
const RING_CAPACITY: usize = 10_000;

/// Smoothing factor: 30% current frame, 70% history.
const SMOOTHING_ALPHA: f32 = 0.3;

/// Bounded ring of recent samples backing the bucket computation.
pub struct VisualizerRing {
    samples: VecDeque<i16>,
}

impl VisualizerRing {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    pub fn push(&mut self, batch: &[i16]) {
        if batch.len() >= RING_CAPACITY {
            self.samples.clear();
            self.samples.extend(&batch[batch.len() - RING_CAPACITY..]);
            return;
        }
        let overflow = (self.samples.len() + batch.len()).saturating_sub(RING_CAPACITY);
        if overflow > 0 {
            self.samples.drain(0..overflow);
        }
        self.samples.extend(batch);
    }

    /// Reduce the ring to per-bucket RMS amplitudes in 0.0..=1.0.
    /// An empty ring yields an all-zero frame.
    pub fn bucket_frame(&self) -> [f32; NUM_BUCKETS] {
        let mut frame = [0.0f32; NUM_BUCKETS];
        if self.samples.is_empty() {
            return frame;
        }

        let per_bucket = (self.samples.len() / NUM_BUCKETS).max(1);
        for (idx, slot) in frame.iter_mut().enumerate() {
            let start = idx * per_bucket;
            if start >= self.samples.len() {
                break;
            }
            let end = ((idx + 1) * per_bucket).min(self.samples.len());
            let sum_squares: f64 = (start..end)
                .map(|i| {
                    let v = self.samples[i] as f64 / i16::MAX as f64;
                    v * v
                })
                .sum();
            let rms = (sum_squares / (end - start) as f64).sqrt();
            *slot = (rms as f32).clamp(0.0, 1.0);
        }
        frame
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}

impl Default for VisualizerRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential-moving-average smoother over successive frames.
struct FrameSmoother {
    prev: [f32; NUM_BUCKETS],
    primed: bool,
}

impl FrameSmoother {
    fn new() -> Self {
        Self {
            prev: [0.0; NUM_BUCKETS],
            primed: false,
        }
    }

    fn apply(&mut self, frame: &mut [f32; NUM_BUCKETS]) {
        if !self.primed {
            self.prev = *frame;
            self.primed = true;
            return;
        }
        for (cur, prev) in frame.iter_mut().zip(self.prev.iter()) {
            *cur = SMOOTHING_ALPHA * *cur + (1.0 - SMOOTHING_ALPHA) * prev;
        }
        self.prev = *frame;
    }
}

/// Drain sampler batches and publish smoothed bucket frames until the
/// pipeline is disposed.
pub async fn run_visualizer(
    events: mpsc::Sender<PipelineEvent>,
    mut sampler_rx: mpsc::Receiver<Vec<i16>>,
    frame_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ring = VisualizerRing::new();
    let mut smoother = FrameSmoother::new();
    let mut tick = interval(frame_interval);

    log::debug!("Visualizer sampler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                while let Ok(batch) = sampler_rx.try_recv() {
                    ring.push(&batch);
                }
                let mut frame = ring.bucket_frame();
                smoother.apply(&mut frame);
                if events.send(PipelineEvent::VisualizerFrame(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    ring.clear();
    log::debug!("Visualizer sampler stopped");
}
