//! Speaker output for the ring cue using cpal.
//!
//! The cpal stream lives on a dedicated OS thread so the sink stays
//! `Send + Sync`. Frames arrive as 8 kHz mono i16 and are resampled to the
//! device rate when it cannot run at 8 kHz.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, StreamConfig};

use super::tone::{AudioSink, SAMPLE_RATE};

const TONE_RATE: u32 = SAMPLE_RATE as u32;

/// Frames buffered between the engine and the device (about 2 seconds).
const QUEUE_FRAMES: usize = 100;

/// Linear-interpolation resampler.
pub fn resample(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let step = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / step).round() as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let a = samples[idx.min(last)] as f64;
            let b = samples[(idx + 1).min(last)] as f64;
            (a + (pos - idx as f64) * (b - a)).round() as i16
        })
        .collect()
}

/// Default output device as an [`AudioSink`].
pub struct CpalSink {
    frames: mpsc::SyncSender<Vec<i16>>,
    _keep_alive: mpsc::Sender<()>,
}

impl CpalSink {
    /// Open the default output device. `None` (with a warning) on headless hosts.
    pub fn open() -> Option<Self> {
        let (frame_tx, frame_rx) = mpsc::sync_channel::<Vec<i16>>(QUEUE_FRAMES);
        let (keep_tx, keep_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<bool>();

        thread::spawn(move || {
            let stream = match build_stream(frame_rx) {
                Some(stream) => stream,
                None => {
                    let _ = ready_tx.send(false);
                    return;
                }
            };
            let _ = ready_tx.send(true);
            // Stream stays alive until the sink is dropped.
            let _ = keep_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(true) => Some(Self {
                frames: frame_tx,
                _keep_alive: keep_tx,
            }),
            _ => None,
        }
    }
}

impl AudioSink for CpalSink {
    fn play(&self, frame: Vec<i16>) {
        // A full queue means the device stalled; drop rather than block the engine.
        let _ = self.frames.try_send(frame);
    }
}

fn build_stream(frame_rx: mpsc::Receiver<Vec<i16>>) -> Option<cpal::Stream> {
    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(d) => d,
        None => {
            tracing::warn!("No audio output device found; ringing is silent");
            return None;
        }
    };
    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    let (config, device_rate) = match pick_output_config(&device) {
        Some(c) => c,
        None => {
            tracing::warn!("No usable output config for {}", dev_name);
            return None;
        }
    };

    let pending = Arc::new(Mutex::new(VecDeque::<i16>::new()));
    let feeder_pending = pending.clone();
    thread::spawn(move || {
        while let Ok(frame) = frame_rx.recv() {
            let samples = resample(&frame, TONE_RATE, device_rate);
            feeder_pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(samples);
        }
    });

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let mut queue = pending.lock().unwrap_or_else(PoisonError::into_inner);
                for sample in data.iter_mut() {
                    *sample = queue.pop_front().unwrap_or(0);
                }
            },
            |err| tracing::warn!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| tracing::warn!("Failed to build audio output stream: {}", e))
        .ok()?;
    stream
        .play()
        .map_err(|e| tracing::warn!("Failed to start audio output stream: {}", e))
        .ok()?;

    tracing::info!("Ring output on {} at {}Hz", dev_name, device_rate);
    Some(stream)
}

/// Mono i16 output, at the tone rate if the device allows it.
fn pick_output_config(device: &Device) -> Option<(StreamConfig, u32)> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> =
        device.supported_output_configs().ok()?.collect();
    let supports = |r: &cpal::SupportedStreamConfigRange, rate: u32| {
        r.min_sample_rate() <= SampleRate(rate) && r.max_sample_rate() >= SampleRate(rate)
    };

    let range = ranges
        .iter()
        .find(|r| r.sample_format() == SampleFormat::I16 && supports(r, TONE_RATE))
        .or_else(|| ranges.iter().find(|r| r.sample_format() == SampleFormat::I16))?;

    let rate = [TONE_RATE, 48000, 44100]
        .into_iter()
        .find(|&rate| supports(range, rate))
        .unwrap_or(range.max_sample_rate().0);
    let mut config: StreamConfig = range.clone().with_sample_rate(SampleRate(rate)).into();
    config.channels = 1;
    Some((config, rate))
}
