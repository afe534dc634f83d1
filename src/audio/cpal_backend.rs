//! Platform audio backend using cpal.
//!
//! cpal delivers audio through callbacks on its own high-priority thread. The
//! devices here bridge that to the blocking read/write model of the pipeline
//! with lock-free ring buffers, so the callbacks never wait on the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedStreamConfig};
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tracing::{debug, info, warn};

use super::device::{AudioBackend, CaptureDevice, PlaybackDevice};
use super::util::{bytes_to_samples, downmix_frame, find_stream_config, get_device_name, min_buffer_bytes, samples_to_bytes};
use crate::config::audio::BYTES_PER_SAMPLE;
use crate::config::{AudioConfig, InputSource};
use crate::error::DeviceError;

/// Ring capacity as a multiple of the frame size. Keeps latency to a few frames.
const RING_FRAMES: usize = 4;

/// Device name fragments that identify a camera-mounted microphone.
const CAMERA_MIC_HINTS: [&str; 3] = ["camera", "webcam", "cam "];

/// Wakes blocked reads/writes from the audio callback and carries stream errors.
#[derive(Default)]
struct StreamSignal {
    lock: Mutex<Option<String>>,
    cond: Condvar,
}

impl StreamSignal {
    /// Called by the audio callback after it moved samples through the ring.
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    fn fail(&self, reason: String) {
        *self.lock.lock() = Some(reason);
        self.cond.notify_all();
    }

    /// Block until `ready` holds, the stream fails, or `deadline` passes.
    ///
    /// `ready` runs under the lock the callback notifies under, so a callback
    /// between the check and the wait cannot be missed.
    fn wait_for(&self, device: &'static str, deadline: Instant, mut ready: impl FnMut() -> bool) -> Result<(), DeviceError> {
        let mut guard = self.lock.lock();
        loop {
            if let Some(reason) = guard.as_ref() {
                return Err(DeviceError::io(device, reason));
            }
            if ready() || Instant::now() >= deadline {
                return Ok(());
            }
            self.cond.wait_until(&mut guard, deadline);
        }
    }
}

/// Backend over the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn input_device(&self, source: InputSource) -> Option<Device> {
        let host = cpal::default_host();
        if source == InputSource::CameraMic {
            let camera = host.input_devices().ok().and_then(|mut devices| {
                devices.find(|device| {
                    let name = get_device_name(device).to_lowercase();
                    CAMERA_MIC_HINTS.iter().any(|hint| name.contains(hint))
                })
            });
            if camera.is_some() {
                return camera;
            }
            warn!("No camera microphone found, using default input device");
        }
        host.default_input_device()
    }

    fn output_device(&self) -> Option<Device> {
        cpal::default_host().default_output_device()
    }

    fn capture_config(&self, device: &Device, config: &AudioConfig) -> Option<SupportedStreamConfig> {
        let configs = device.supported_input_configs().ok()?;
        find_stream_config(configs, config.sample_rate)
    }

    fn playback_config(&self, device: &Device, config: &AudioConfig) -> Option<SupportedStreamConfig> {
        let configs = device.supported_output_configs().ok()?;
        find_stream_config(configs, config.sample_rate)
    }
}

impl AudioBackend for CpalBackend {
    fn min_capture_buffer_size(&self, config: &AudioConfig) -> usize {
        self.input_device(config.input_source)
            .and_then(|device| self.capture_config(&device, config))
            .map_or(0, |supported| min_buffer_bytes(&supported, config))
    }

    fn min_playback_buffer_size(&self, config: &AudioConfig) -> usize {
        self.output_device()
            .and_then(|device| self.playback_config(&device, config))
            .map_or(0, |supported| min_buffer_bytes(&supported, config))
    }

    fn open_capture(&self, config: &AudioConfig, buffer_size: usize) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let device = self
            .input_device(config.input_source)
            .ok_or_else(|| DeviceError::acquisition("capture", "no input device available"))?;
        let supported = self
            .capture_config(&device, config)
            .ok_or_else(|| DeviceError::acquisition("capture", format!("{} Hz not supported", config.sample_rate)))?;

        info!("Using input device: {}", get_device_name(&device));
        debug!("Capture config: {} Hz, {} channels, {:?}", config.sample_rate, supported.channels(), supported.sample_format());

        let frame_samples = buffer_size / BYTES_PER_SAMPLE;
        let (producer, consumer) = HeapRb::<i16>::new(frame_samples * RING_FRAMES).split();
        let signal = Arc::new(StreamSignal::default());
        let overruns = Arc::new(AtomicU64::new(0));
        let stream_config: StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_capture_stream::<i16>(&device, &stream_config, producer, signal.clone(), overruns.clone()),
            SampleFormat::F32 => build_capture_stream::<f32>(&device, &stream_config, producer, signal.clone(), overruns.clone()),
            other => return Err(DeviceError::acquisition("capture", format!("unsupported sample format {:?}", other))),
        }
        .map_err(|e| DeviceError::acquisition("capture", e))?;

        Ok(Box::new(CpalCapture {
            stream,
            consumer,
            signal,
            overruns,
            scratch: vec![0; frame_samples],
            read_timeout: frame_timeout(config, buffer_size),
            playing: false,
        }))
    }

    fn open_playback(&self, config: &AudioConfig, buffer_size: usize) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        let device = self.output_device().ok_or_else(|| DeviceError::acquisition("playback", "no output device available"))?;
        let supported = self
            .playback_config(&device, config)
            .ok_or_else(|| DeviceError::acquisition("playback", format!("{} Hz not supported", config.sample_rate)))?;

        info!("Using output device: {}", get_device_name(&device));
        debug!("Playback config: {} Hz, {} channels, {:?}", config.sample_rate, supported.channels(), supported.sample_format());

        let ring_samples = buffer_size / BYTES_PER_SAMPLE * RING_FRAMES;
        let (producer, consumer) = HeapRb::<i16>::new(ring_samples).split();
        let signal = Arc::new(StreamSignal::default());
        let stream_config: StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_playback_stream::<i16>(&device, &stream_config, consumer, signal.clone()),
            SampleFormat::F32 => build_playback_stream::<f32>(&device, &stream_config, consumer, signal.clone()),
            other => return Err(DeviceError::acquisition("playback", format!("unsupported sample format {:?}", other))),
        }
        .map_err(|e| DeviceError::acquisition("playback", e))?;

        Ok(Box::new(CpalPlayback {
            stream,
            producer,
            signal,
            samples: Vec::with_capacity(ring_samples),
            write_timeout: frame_timeout(config, buffer_size),
            playing: false,
        }))
    }
}

/// Twice the duration of one buffer, so a healthy stream always completes in time.
fn frame_timeout(config: &AudioConfig, buffer_size: usize) -> Duration {
    let samples = (buffer_size / BYTES_PER_SAMPLE) as u64;
    Duration::from_micros(samples * 2_000_000 / u64::from(config.sample_rate.max(1))).max(Duration::from_millis(10))
}

fn build_capture_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProd<i16>,
    signal: Arc<StreamSignal>,
    overruns: Arc<AtomicU64>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let err_signal = signal.clone();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                if producer.try_push(downmix_frame(frame)).is_err() {
                    overruns.fetch_add(1, Ordering::Relaxed);
                }
            }
            signal.notify();
        },
        move |err| {
            tracing::error!("Audio capture error: {}", err);
            err_signal.fail(err.to_string());
        },
        None,
    )
}

fn build_playback_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapCons<i16>,
    signal: Arc<StreamSignal>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = usize::from(config.channels);
    let err_signal = signal.clone();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            // Underrun plays silence.
            for frame in data.chunks_mut(channels) {
                let sample = T::from_sample(consumer.try_pop().unwrap_or(0));
                for channel in frame.iter_mut() {
                    *channel = sample;
                }
            }
            signal.notify();
        },
        move |err| {
            tracing::error!("Audio playback error: {}", err);
            err_signal.fail(err.to_string());
        },
        None,
    )
}

struct CpalCapture {
    stream: Stream,
    consumer: HeapCons<i16>,
    signal: Arc<StreamSignal>,
    overruns: Arc<AtomicU64>,
    scratch: Vec<i16>,
    read_timeout: Duration,
    playing: bool,
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream.play().map_err(|e| DeviceError::acquisition("capture", e))?;
        self.playing = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let wanted = (buf.len() / BYTES_PER_SAMPLE).min(self.scratch.len());
        let deadline = Instant::now() + self.read_timeout;
        let consumer = &self.consumer;
        self.signal.wait_for("capture", deadline, || consumer.occupied_len() >= wanted)?;

        let popped = self.consumer.pop_slice(&mut self.scratch[..wanted]);
        Ok(samples_to_bytes(&self.scratch[..popped], buf))
    }

    fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        if let Err(e) = self.stream.pause() {
            debug!("Failed to pause capture stream: {}", e);
        }
        let overruns = self.overruns.load(Ordering::Relaxed);
        if overruns > 0 {
            warn!("Capture ring overflowed, dropped {} samples", overruns);
        }
        debug!("Audio capture stopped");
    }
}

struct CpalPlayback {
    stream: Stream,
    producer: HeapProd<i16>,
    signal: Arc<StreamSignal>,
    samples: Vec<i16>,
    write_timeout: Duration,
    playing: bool,
}

impl PlaybackDevice for CpalPlayback {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream.play().map_err(|e| DeviceError::acquisition("playback", e))?;
        self.playing = true;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        bytes_to_samples(buf, &mut self.samples);
        let deadline = Instant::now() + self.write_timeout;
        let mut pushed = 0;
        let (producer, samples) = (&mut self.producer, &self.samples);
        self.signal.wait_for("playback", deadline, || {
            pushed += producer.push_slice(&samples[pushed..]);
            pushed == samples.len()
        })?;

        Ok(pushed * BYTES_PER_SAMPLE)
    }

    fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        if let Err(e) = self.stream.pause() {
            debug!("Failed to pause playback stream: {}", e);
        }
        debug!("Audio playback stopped");
    }
}
