//! cpal device backend bridged to the blocking sonar loops
//!
//! Provides:
//! - Device enumeration ([`list_devices`])
//! - A duplex stream pair whose callbacks only touch lock-free rings
//!   ([`CpalDuplex`]), exposed to the loops as [`RingInput`]/[`RingOutput`]
//!
//! The input callback folds any device channel count into interleaved
//! stereo (a mono device is duplicated onto both channels). The output
//! callback copies each mono sample onto every device channel. Stream error
//! callbacks raise a fault flag that turns the next loop read or write into
//! [`AudioError::Stream`], so a device failure ends the owning loop.

use super::{AudioError, AudioInput, AudioOutput};
use crate::SHORT_MAX;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Common sample rates probed when listing devices
const COMMON_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Audio device information
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Whether this is the default input or output device
    pub is_default: bool,
    /// Supported sample rates
    pub sample_rates: Vec<u32>,
    /// Number of input channels
    pub input_channels: u16,
    /// Number of output channels
    pub output_channels: u16,
}

/// List the devices of the default host
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    for device in host.devices()? {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let is_default =
            default_input.as_deref() == Some(name.as_str())
                || default_output.as_deref() == Some(name.as_str());

        let input_channels = device
            .default_input_config()
            .map(|c| c.channels())
            .unwrap_or(0);
        let output_channels = device
            .default_output_config()
            .map(|c| c.channels())
            .unwrap_or(0);

        let mut sample_rates = Vec::new();
        let ranges = device
            .supported_input_configs()
            .map(|c| c.collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .chain(
                device
                    .supported_output_configs()
                    .map(|c| c.collect::<Vec<_>>())
                    .unwrap_or_default(),
            );
        for config in ranges {
            for &rate in &COMMON_RATES {
                if (config.min_sample_rate().0..=config.max_sample_rate().0).contains(&rate)
                    && !sample_rates.contains(&rate)
                {
                    sample_rates.push(rate);
                }
            }
        }
        sample_rates.sort();

        devices.push(DeviceInfo {
            name,
            is_default,
            sample_rates,
            input_channels,
            output_channels,
        });
    }

    if devices.is_empty() {
        return Err(AudioError::NoDevicesFound.into());
    }
    Ok(devices)
}

fn find_device(host: &Host, name: &str) -> Result<Device> {
    host.devices()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()).into())
}

/// Convert a normalized device sample to i16
#[inline]
fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * SHORT_MAX) as i16
}

/// Running input and output streams
///
/// Streams stay on the thread that opened them; only the ring ends returned
/// by [`CpalDuplex::open`] move to the loop threads. Dropping this value
/// closes both streams.
pub struct CpalDuplex {
    input_stream: Stream,
    output_stream: Stream,
    sample_rate: u32,
    overruns: Arc<AtomicU64>,
}

impl CpalDuplex {
    /// Open and start capture and playback
    ///
    /// # Arguments
    /// * `input_name` - Capture device, `None` for the host default
    /// * `output_name` - Playback device, `None` for the host default
    /// * `sample_rate` - Rate for both streams
    /// * `ring_frames` - Per-channel capacity of each ring
    pub fn open(
        input_name: Option<&str>,
        output_name: Option<&str>,
        sample_rate: u32,
        ring_frames: usize,
    ) -> Result<(Self, RingInput, RingOutput)> {
        let host = cpal::default_host();

        let input_device = match input_name {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_input_device()
                .ok_or(AudioError::NoInputChannels)?,
        };
        let output_device = match output_name {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_output_device()
                .ok_or(AudioError::NoOutputChannels)?,
        };

        let input_channels = input_device
            .default_input_config()
            .map(|c| c.channels())
            .map_err(|_| AudioError::NoInputChannels)?;
        let output_channels = output_device
            .default_output_config()
            .map(|c| c.channels())
            .map_err(|_| AudioError::NoOutputChannels)?;

        tracing::info!(
            input = %input_device.name().unwrap_or_default(),
            output = %output_device.name().unwrap_or_default(),
            input_channels,
            output_channels,
            sample_rate,
            "Opening audio devices"
        );

        let input_config = StreamConfig {
            channels: input_channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let output_config = StreamConfig {
            channels: output_channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let fault = Arc::new(AtomicBool::new(false));
        let overruns = Arc::new(AtomicU64::new(0));

        let (mut capture_producer, capture_consumer) =
            HeapRb::<i16>::new(ring_frames.max(1) * 2).split();
        let (playback_producer, mut playback_consumer) =
            HeapRb::<i16>::new(ring_frames.max(1)).split();

        let input_fault = Arc::clone(&fault);
        let input_overruns = Arc::clone(&overruns);
        let num_input_channels = input_channels as usize;
        let mut first_input = true;
        let input_stream = input_device
            .build_input_stream(
                &input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if first_input {
                        first_input = false;
                        tracing::info!(
                            frames = data.len() / num_input_channels.max(1),
                            channels = num_input_channels,
                            "Input callback started"
                        );
                    }
                    for frame in data.chunks(num_input_channels.max(1)) {
                        if capture_producer.vacant_len() < 2 {
                            input_overruns.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                        let a = frame.first().copied().map(to_i16).unwrap_or(0);
                        let b = frame.get(1).copied().map(to_i16).unwrap_or(a);
                        let _ = capture_producer.try_push(a);
                        let _ = capture_producer.try_push(b);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "Input stream error");
                    input_fault.store(true, Ordering::Release);
                },
                None,
            )
            .context("Failed to build input stream")?;

        let output_fault = Arc::clone(&fault);
        let num_output_channels = output_channels as usize;
        let mut first_output = true;
        let output_stream = output_device
            .build_output_stream(
                &output_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if first_output {
                        first_output = false;
                        tracing::info!(
                            frames = data.len() / num_output_channels.max(1),
                            channels = num_output_channels,
                            "Output callback started"
                        );
                    }
                    for frame in data.chunks_mut(num_output_channels.max(1)) {
                        let sample = playback_consumer
                            .try_pop()
                            .map(|s| s as f32 / SHORT_MAX)
                            .unwrap_or(0.0);
                        frame.fill(sample);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "Output stream error");
                    output_fault.store(true, Ordering::Release);
                },
                None,
            )
            .context("Failed to build output stream")?;

        output_stream
            .play()
            .map_err(|e| anyhow!("Failed to start output stream: {}", e))?;
        input_stream
            .play()
            .map_err(|e| anyhow!("Failed to start input stream: {}", e))?;

        tracing::info!(sample_rate, "Audio streams started");

        Ok((
            Self {
                input_stream,
                output_stream,
                sample_rate,
                overruns,
            },
            RingInput::new(capture_consumer, Arc::clone(&fault)),
            RingOutput::new(playback_producer, fault),
        ))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Input callbacks that found the capture ring full
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Pause both streams
    pub fn pause(&self) -> Result<()> {
        self.input_stream.pause()?;
        self.output_stream.pause()?;
        Ok(())
    }
}

/// Capture ring end, yielding interleaved stereo samples
pub struct RingInput {
    consumer: HeapCons<i16>,
    fault: Arc<AtomicBool>,
}

impl RingInput {
    pub fn new(consumer: HeapCons<i16>, fault: Arc<AtomicBool>) -> Self {
        Self { consumer, fault }
    }
}

impl AudioInput for RingInput {
    fn read(&mut self, buf: &mut [i16]) -> Result<usize, AudioError> {
        if self.fault.load(Ordering::Acquire) {
            return Err(AudioError::Stream("input device reported an error".into()));
        }
        // Whole stereo frames only, so channel parity never shifts
        let n = (buf.len().min(self.consumer.occupied_len())) & !1;
        Ok(self.consumer.pop_slice(&mut buf[..n]))
    }
}

/// Playback ring end, accepting mono samples
pub struct RingOutput {
    producer: HeapProd<i16>,
    fault: Arc<AtomicBool>,
}

impl RingOutput {
    pub fn new(producer: HeapProd<i16>, fault: Arc<AtomicBool>) -> Self {
        Self { producer, fault }
    }
}

impl AudioOutput for RingOutput {
    fn write(&mut self, buf: &[i16]) -> Result<usize, AudioError> {
        if self.fault.load(Ordering::Acquire) {
            return Err(AudioError::Stream("output device reported an error".into()));
        }
        Ok(self.producer.push_slice(buf))
    }
}
