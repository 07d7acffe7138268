//! Ringback / ringtone synthesis.
//!
//! A fixed-pitch sine cue with a short exponential decay, repeated on a
//! timer until stopped. Frames are 20ms of 8kHz mono PCM handed to an
//! [`AudioSink`]; without the `audio` feature the sink just discards them.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

pub const RING_FREQUENCY_HZ: f64 = 440.0;
pub const SAMPLE_RATE: f64 = 8000.0;
pub const FRAME_SAMPLES: usize = 160;

/// Default gap between the start of two cues.
pub const DEFAULT_RING_INTERVAL: Duration = Duration::from_millis(2000);

const PEAK_GAIN: f64 = 0.1;
const FLOOR_GAIN: f64 = 0.001;
const CUE_SECONDS: f64 = 0.8;

/// Generates the decaying sine cue frame by frame.
pub struct ToneGenerator {
    phase: f64,
    frequency: f64,
    sample_rate: f64,
    position: usize,
}

impl ToneGenerator {
    pub fn new(frequency: f64) -> Self {
        Self {
            phase: 0.0,
            frequency,
            sample_rate: SAMPLE_RATE,
            position: 0,
        }
    }

    /// Samples in one cue.
    pub fn cue_samples(&self) -> usize {
        (CUE_SECONDS * self.sample_rate) as usize
    }

    /// Envelope gain `position` samples into the cue; silent past the end.
    pub fn gain_at(&self, position: usize) -> f64 {
        let t = position as f64 / self.sample_rate;
        if t >= CUE_SECONDS {
            return 0.0;
        }
        PEAK_GAIN * (FLOOR_GAIN / PEAK_GAIN).powf(t / CUE_SECONDS)
    }

    /// Restart the envelope for a new cue.
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.position = 0;
    }

    pub fn next_frame(&mut self) -> Vec<i16> {
        let phase_inc = 2.0 * std::f64::consts::PI * self.frequency / self.sample_rate;
        let mut samples = Vec::with_capacity(FRAME_SAMPLES);
        for _ in 0..FRAME_SAMPLES {
            let gain = self.gain_at(self.position);
            samples.push((self.phase.sin() * gain * 32767.0) as i16);
            self.phase = (self.phase + phase_inc) % (2.0 * std::f64::consts::PI);
            self.position += 1;
        }
        samples
    }

    /// All frames of one cue, starting from a fresh envelope.
    pub fn cue(&mut self) -> Vec<Vec<i16>> {
        self.reset();
        let frames = self.cue_samples().div_ceil(FRAME_SAMPLES);
        (0..frames).map(|_| self.next_frame()).collect()
    }
}

/// Destination for synthesized audio.
pub trait AudioSink: Send + Sync {
    fn play(&self, frame: Vec<i16>);
}

/// Discards audio (headless hosts, tests).
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _frame: Vec<i16>) {}
}

/// Repeating ring cue. `start` is a no-op while ringing, `stop` is always safe.
pub struct Ringer {
    sink: Arc<dyn AudioSink>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl Ringer {
    pub fn new(sink: Arc<dyn AudioSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            task: None,
        }
    }

    #[cfg(test)]
    pub fn is_ringing(&self) -> bool {
        self.task.is_some()
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        tracing::debug!("Ringing started");
        let sink = self.sink.clone();
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut gen = ToneGenerator::new(RING_FREQUENCY_HZ);
            let mut ticker = time::interval(period);
            loop {
                ticker.tick().await;
                for frame in gen.cue() {
                    sink.play(frame);
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
            tracing::debug!("Ringing stopped");
        }
    }
}

impl Drop for Ringer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        frames: AtomicUsize,
    }

    impl AudioSink for CountingSink {
        fn play(&self, _frame: Vec<i16>) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_envelope_decays_to_floor() {
        let gen = ToneGenerator::new(RING_FREQUENCY_HZ);
        assert!((gen.gain_at(0) - PEAK_GAIN).abs() < 1e-9);
        let near_end = gen.gain_at(gen.cue_samples() - 1);
        assert!(near_end < 0.0011 && near_end > 0.0009, "gain {}", near_end);
        assert_eq!(gen.gain_at(gen.cue_samples()), 0.0);
    }

    #[test]
    fn test_cue_is_audible_then_fades() {
        let mut gen = ToneGenerator::new(RING_FREQUENCY_HZ);
        let cue = gen.cue();
        assert_eq!(cue.len(), 40);
        assert!(cue.iter().all(|f| f.len() == FRAME_SAMPLES));

        let peak = |f: &Vec<i16>| f.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);
        assert!(peak(&cue[0]) > 2000);
        assert!(peak(&cue[39]) < peak(&cue[0]) / 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ringer_repeats_until_stopped() {
        let sink = Arc::new(CountingSink::default());
        let mut ringer = Ringer::new(sink.clone(), DEFAULT_RING_INTERVAL);

        ringer.stop(); // not started: harmless
        ringer.start();
        ringer.start(); // already ringing: no second task
        assert!(ringer.is_ringing());

        time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(sink.frames.load(Ordering::SeqCst), 80);

        ringer.stop();
        assert!(!ringer.is_ringing());
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.frames.load(Ordering::SeqCst), 80);
    }
}
