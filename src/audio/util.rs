//! Shared helpers for the cpal capture and playback devices.

use cpal::traits::DeviceTrait;
use cpal::{Device, FromSample, Sample, SampleFormat, SupportedBufferSize, SupportedStreamConfig, SupportedStreamConfigRange};

use crate::config::AudioConfig;
use crate::config::audio::BYTES_PER_SAMPLE;

/// Shortest frame the platform buffer is rounded up to, in milliseconds.
const MIN_FRAME_MILLIS: u32 = 10;

/// Frame used when the platform cannot report a buffer range, in milliseconds.
const FALLBACK_FRAME_MILLIS: u32 = 20;

/// Get a human-readable device name.
///
/// # Returns
/// Device name string, or "Unknown" if the name cannot be retrieved.
pub fn get_device_name(device: &Device) -> String {
    device.description().ok().map(|desc| desc.name().to_string()).unwrap_or_else(|| "Unknown".to_string())
}

/// Find a stream configuration that runs at exactly `sample_rate`.
///
/// Only mono or stereo layouts with I16 or F32 samples are considered.
/// I16 is preferred since it needs no conversion, then fewer channels.
/// Returns `None` when the device cannot run at the rate at all.
pub fn find_stream_config(configs: impl Iterator<Item = SupportedStreamConfigRange>, sample_rate: u32) -> Option<SupportedStreamConfig> {
    configs
        .filter(|config| config.channels() >= 1 && config.channels() <= 2)
        .filter(|config| matches!(config.sample_format(), SampleFormat::I16 | SampleFormat::F32))
        .filter(|config| sample_rate >= config.min_sample_rate() && sample_rate <= config.max_sample_rate())
        .min_by_key(|config| (config.sample_format() != SampleFormat::I16, config.channels()))
        .map(|config| config.with_sample_rate(sample_rate))
}

/// Minimum buffer size in bytes of 16-bit mono PCM for a supported config.
pub fn min_buffer_bytes(config: &SupportedStreamConfig, audio: &AudioConfig) -> usize {
    let floor = audio.bytes_for_millis(MIN_FRAME_MILLIS);
    match config.buffer_size() {
        SupportedBufferSize::Range { min, .. } if *min > 0 => (*min as usize * BYTES_PER_SAMPLE).max(floor),
        _ => audio.bytes_for_millis(FALLBACK_FRAME_MILLIS),
    }
}

/// Mix one interleaved frame down to a single 16-bit sample.
pub fn downmix_frame<T>(frame: &[T]) -> i16
where
    T: Sample,
    f32: FromSample<T>,
{
    if frame.len() == 1 {
        return i16::from_sample(f32::from_sample(frame[0]));
    }
    let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
    i16::from_sample(sum / frame.len() as f32)
}

/// Decode little-endian 16-bit PCM bytes. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8], out: &mut Vec<i16>) {
    out.clear();
    out.extend(bytes.chunks_exact(BYTES_PER_SAMPLE).map(|b| i16::from_le_bytes([b[0], b[1]])));
}

/// Encode 16-bit samples as little-endian bytes into `out`, returning bytes written.
pub fn samples_to_bytes(samples: &[i16], out: &mut [u8]) -> usize {
    let mut written = 0;
    for (chunk, sample) in out.chunks_exact_mut(BYTES_PER_SAMPLE).zip(samples) {
        chunk.copy_from_slice(&sample.to_le_bytes());
        written += BYTES_PER_SAMPLE;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stereo_to_mono_f32() {
        assert_eq!(downmix_frame(&[0.5f32, 0.5]), i16::from_sample(0.5f32));
        assert_eq!(downmix_frame(&[1.0f32, -1.0]), 0);
    }

    #[test]
    fn test_mono_i16_passes_through() {
        assert_eq!(downmix_frame(&[1234i16]), 1234);
        assert_eq!(downmix_frame(&[-32768i16]), -32768);
    }

    #[test]
    fn test_pcm_bytes_round_trip() {
        let mut samples = Vec::new();
        bytes_to_samples(&[0x01, 0x02, 0xff, 0x7f, 0x09], &mut samples);
        assert_eq!(samples, vec![0x0201, i16::MAX]);

        let mut bytes = [0u8; 4];
        assert_eq!(samples_to_bytes(&samples, &mut bytes), 4);
        assert_eq!(bytes, [0x01, 0x02, 0xff, 0x7f]);
    }
}
