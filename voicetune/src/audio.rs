//! Audio clip loading and normalization.

use crate::{Result, VoiceTuneError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use tracing::debug;

/// A mono clip held as `f32` samples in `[-1, 1]`.
#[derive(Clone)]
pub struct AudioData {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioData {
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.num_samples() as f32 / self.sample_rate as f32
    }

    /// Scale the clip so its peak absolute amplitude is 1.0.
    ///
    /// Clips whose peak is below the smallest normal `f32` are left as-is.
    pub fn normalize_peak(&mut self) {
        let peak = self
            .samples
            .iter()
            .fold(0.0f32, |acc, &s| acc.max(s.abs()));
        if peak < f32::MIN_POSITIVE {
            return;
        }
        for s in self.samples.iter_mut() {
            *s /= peak;
        }
    }

    /// Write the clip as a 32-bit float WAV (no clipping or quantization).
    pub fn save_wav(&self, path: impl AsRef<Path>) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let wav_err = |e: hound::Error| {
            VoiceTuneError::IoError(format!("{}: {}", path.as_ref().display(), e))
        };

        let mut writer = hound::WavWriter::create(path.as_ref(), spec).map_err(wav_err)?;
        for &s in &self.samples {
            writer.write_sample(s).map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)
    }
}

impl std::fmt::Debug for AudioData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AudioData({} samples @ {} Hz, {:.2}s)",
            self.samples.len(),
            self.sample_rate,
            self.duration_secs()
        )
    }
}

/// Load a WAV clip as mono at `target_sample_rate`.
///
/// Only the first `max_duration_secs` seconds of the source are kept; the cut
/// happens before resampling.
pub fn load_clip(
    path: impl AsRef<Path>,
    target_sample_rate: u32,
    max_duration_secs: Option<f32>,
) -> Result<AudioData> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(VoiceTuneError::AudioError(format!(
            "Audio file does not exist: {}",
            path.display()
        )));
    }

    let mut reader = hound::WavReader::open(path).map_err(|e| {
        VoiceTuneError::AudioError(format!("Failed to open WAV '{}': {}", path.display(), e))
    })?;

    let spec = reader.spec();
    debug!(
        "WAV spec: channels={}, sample_rate={}, bits_per_sample={}",
        spec.channels, spec.sample_rate, spec.bits_per_sample
    );

    if spec.sample_rate == 0 || spec.channels == 0 {
        return Err(VoiceTuneError::AudioError(format!(
            "Invalid WAV header in '{}': {} Hz, {} channels",
            path.display(),
            spec.sample_rate,
            spec.channels
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<_, _>>()
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>(),
    }
    .map_err(|e| {
        VoiceTuneError::AudioError(format!("Failed to decode '{}': {}", path.display(), e))
    })?;

    let mut mono = downmix(samples, spec.channels as usize);
    debug!("After mono conversion: {} samples", mono.len());

    if let Some(max_secs) = max_duration_secs {
        let max_samples = (max_secs as f64 * spec.sample_rate as f64).round() as usize;
        mono.truncate(max_samples);
    }

    if mono.is_empty() {
        return Err(VoiceTuneError::AudioError(format!(
            "Loaded audio is empty: {}",
            path.display()
        )));
    }

    let samples = if spec.sample_rate != target_sample_rate {
        debug!(
            "Resampling from {} Hz to {} Hz",
            spec.sample_rate, target_sample_rate
        );
        resample_audio(&mono, spec.sample_rate, target_sample_rate)?
    } else {
        mono
    };

    Ok(AudioData::from_samples(samples, target_sample_rate))
}

fn downmix(samples: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Resample mono audio with windowed-sinc interpolation.
///
/// Output length is `round(len * target / source)`.
pub fn resample_audio(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if source_rate == target_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let resample_ratio = target_rate as f64 / source_rate as f64;
    let expected_len = (samples.len() as f64 * resample_ratio).round() as usize;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(resample_ratio, 2.0, params, samples.len(), 1)
        .map_err(|e| VoiceTuneError::AudioError(format!("Failed to create resampler: {}", e)))?;

    let resample_err = |e: rubato::ResampleError| {
        VoiceTuneError::AudioError(format!("Resampling failed: {}", e))
    };
    let first_channel = |channels: Vec<Vec<f32>>| {
        channels.into_iter().next().ok_or_else(|| {
            VoiceTuneError::AudioError("No output channel from resampler".to_string())
        })
    };

    let mut resampled = first_channel(
        resampler
            .process(&[samples.to_vec()], None)
            .map_err(resample_err)?,
    )?;

    // One call stops half a sinc window short of the input end; flushing with
    // silence yields the remaining tail.
    let tail = first_channel(
        resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(resample_err)?,
    )?;
    resampled.extend(tail);

    resampled.resize(expected_len, 0.0);
    Ok(resampled)
}
