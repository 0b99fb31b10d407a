//! Log-mel spectrogram targets with a fixed frame budget.
//!
//! Power spectrogram with centered, reflect-padded framing and a periodic Hann
//! window, projected through a Slaney-scale / Slaney-normalized filterbank and
//! converted to decibels relative to the loudest bin of the clip. Output is
//! time-major `(frames, n_mels)`.

use crate::{Result, VoiceTuneError};
use rustfft::{FftPlanner, num_complex::Complex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Floor applied to power values before taking the logarithm.
pub const AMIN: f32 = 1e-10;

/// Mel extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub win_length: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f32,
    /// Upper filterbank edge; `None` means Nyquist.
    pub f_max: Option<f32>,
    /// Dynamic range kept below the clip maximum, in dB.
    pub top_db: Option<f32>,
    /// Exact number of frames emitted per clip.
    pub target_frames: usize,
}

impl Default for MelConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 2048,
            win_length: 2048,
            hop_length: 512,
            n_mels: 80,
            f_min: 0.0,
            f_max: None,
            top_db: Some(80.0),
            target_frames: 512,
        }
    }
}

impl MelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VoiceTuneError::ConfigError(
                "mel sample_rate must be positive".to_string(),
            ));
        }
        if self.n_fft < 2 || self.hop_length == 0 || self.n_mels == 0 || self.target_frames == 0
        {
            return Err(VoiceTuneError::ConfigError(format!(
                "mel sizes must be positive (n_fft={}, hop_length={}, n_mels={}, target_frames={})",
                self.n_fft, self.hop_length, self.n_mels, self.target_frames
            )));
        }
        if self.n_fft % 2 != 0 {
            return Err(VoiceTuneError::ConfigError(format!(
                "n_fft must be even, got {}",
                self.n_fft
            )));
        }
        if self.win_length == 0 || self.win_length > self.n_fft {
            return Err(VoiceTuneError::ConfigError(format!(
                "win_length {} must be in 1..={}",
                self.win_length, self.n_fft
            )));
        }
        let nyquist = self.sample_rate as f32 / 2.0;
        let f_max = self.f_max.unwrap_or(nyquist);
        if self.f_min < 0.0 || f_max <= self.f_min || f_max > nyquist {
            return Err(VoiceTuneError::ConfigError(format!(
                "invalid mel band [{}, {}] for sample rate {}",
                self.f_min, f_max, self.sample_rate
            )));
        }
        Ok(())
    }

    /// Number of raw samples that map onto exactly `target_frames` hops.
    pub fn target_samples(&self) -> usize {
        self.target_frames * self.hop_length
    }
}

/// One triangular filter, stored from its first non-zero FFT bin.
#[derive(Debug, Clone)]
struct MelFilter {
    start_bin: usize,
    weights: Vec<f32>,
}

/// Mel spectrogram extractor with a cached FFT plan, window and filterbank.
pub struct MelSpectrogram {
    config: MelConfig,
    fft: Arc<dyn rustfft::Fft<f32>>,
    window: Vec<f32>,
    filters: Vec<MelFilter>,
}

impl std::fmt::Debug for MelSpectrogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelSpectrogram")
            .field("config", &self.config)
            .finish()
    }
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Result<Self> {
        config.validate()?;

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        let window = padded_hann_window(config.win_length, config.n_fft);
        let f_max = config.f_max.unwrap_or(config.sample_rate as f32 / 2.0);
        let filters = slaney_filterbank(
            config.sample_rate,
            config.n_fft,
            config.n_mels,
            config.f_min,
            f_max,
        );

        Ok(Self {
            config,
            fft,
            window,
            filters,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Number of frames produced for `num_samples` input samples with centered
    /// framing. Exact because `n_fft` is even.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        1 + num_samples / self.config.hop_length
    }

    /// Power mel spectrogram, frame-major: `frames * n_mels` values.
    pub fn mel_power(&self, samples: &[f32]) -> Result<(Vec<f32>, usize)> {
        if samples.is_empty() {
            return Err(VoiceTuneError::AudioError(
                "Cannot compute a spectrogram of an empty clip".to_string(),
            ));
        }

        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let n_mels = self.config.n_mels;
        let pad = (n_fft / 2) as isize;
        let n_frames = self.num_frames(samples.len());
        let n_bins = n_fft / 2 + 1;

        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut power = vec![0.0f32; n_bins];
        let mut mel = vec![0.0f32; n_frames * n_mels];

        for frame in 0..n_frames {
            let start = (frame * hop) as isize - pad;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let src = reflect_index(start + i as isize, samples.len());
                *slot = Complex::new(samples[src] * self.window[i], 0.0);
            }

            self.fft.process(&mut buffer);

            for (p, c) in power.iter_mut().zip(buffer.iter()) {
                *p = c.re * c.re + c.im * c.im;
            }

            let row = &mut mel[frame * n_mels..(frame + 1) * n_mels];
            for (value, filter) in row.iter_mut().zip(self.filters.iter()) {
                *value = filter
                    .weights
                    .iter()
                    .zip(&power[filter.start_bin..])
                    .map(|(w, p)| w * p)
                    .sum();
            }
        }

        Ok((mel, n_frames))
    }

    /// Full target pipeline: fit the waveform to the frame budget, compute the
    /// log-mel spectrogram and force exactly `target_frames` rows.
    ///
    /// Returns `target_frames * n_mels` values in time-major order.
    pub fn log_mel_frames(&self, samples: &[f32]) -> Result<Vec<f32>> {
        let fitted = fit_to_length(samples, self.config.target_samples());
        let (mut mel, n_frames) = self.mel_power(&fitted)?;
        power_to_db(&mut mel, self.config.top_db);
        Ok(fit_frames(
            mel,
            n_frames,
            self.config.n_mels,
            self.config.target_frames,
        ))
    }
}

/// Truncate or zero-pad a waveform to exactly `len` samples.
pub fn fit_to_length(samples: &[f32], len: usize) -> Vec<f32> {
    let mut out = samples[..samples.len().min(len)].to_vec();
    out.resize(len, 0.0);
    out
}

/// Truncate or zero-row-pad a frame-major matrix to `target_frames` rows.
pub fn fit_frames(
    mut values: Vec<f32>,
    n_frames: usize,
    n_mels: usize,
    target_frames: usize,
) -> Vec<f32> {
    debug_assert_eq!(values.len(), n_frames * n_mels);
    values.resize(target_frames * n_mels, 0.0);
    values
}

/// Convert power values to dB relative to their maximum, in place.
pub fn power_to_db(values: &mut [f32], top_db: Option<f32>) {
    let reference = values.iter().cloned().fold(0.0f32, f32::max).max(AMIN);
    let ref_db = 10.0 * reference.log10();

    let mut max_db = f32::NEG_INFINITY;
    for v in values.iter_mut() {
        *v = 10.0 * v.max(AMIN).log10() - ref_db;
        max_db = max_db.max(*v);
    }

    if let Some(top_db) = top_db {
        let floor = max_db - top_db;
        for v in values.iter_mut() {
            *v = v.max(floor);
        }
    }
}

/// Map an index outside `0..len` back inside by mirror reflection without
/// repeating the edge sample.
fn reflect_index(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = index.rem_euclid(period);
    if m >= len as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

/// Periodic Hann window of `win_length`, centered inside `n_fft` zeros.
fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
    let mut window = vec![0.0f32; n_fft];
    let offset = (n_fft - win_length) / 2;
    for i in 0..win_length {
        let phase = 2.0 * std::f64::consts::PI * i as f64 / win_length as f64;
        window[offset + i] = (0.5 - 0.5 * phase.cos()) as f32;
    }
    window
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(freq: f64) -> f64 {
    if freq >= MIN_LOG_HZ {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / log_step()
    } else {
        freq / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-scale triangular filters with Slaney (area) normalization.
fn slaney_filterbank(
    sample_rate: u32,
    n_fft: usize,
    n_mels: usize,
    f_min: f32,
    f_max: f32,
) -> Vec<MelFilter> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|i| i as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_min = hz_to_mel(f_min as f64);
    let mel_max = hz_to_mel(f_max as f64);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    (0..n_mels)
        .map(|m| {
            let (lower, center, upper) = (edges[m], edges[m + 1], edges[m + 2]);
            let enorm = 2.0 / (upper - lower);
            let dense: Vec<f32> = fft_freqs
                .iter()
                .map(|&f| {
                    let rising = (f - lower) / (center - lower);
                    let falling = (upper - f) / (upper - center);
                    (rising.min(falling).max(0.0) * enorm) as f32
                })
                .collect();

            let start_bin = dense.iter().position(|&w| w > 0.0).unwrap_or(0);
            let end_bin = dense
                .iter()
                .rposition(|&w| w > 0.0)
                .map(|i| i + 1)
                .unwrap_or(start_bin);
            MelFilter {
                start_bin,
                weights: dense[start_bin..end_bin].to_vec(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> MelConfig {
        MelConfig {
            n_fft: 512,
            win_length: 512,
            hop_length: 128,
            n_mels: 40,
            target_frames: 16,
            ..MelConfig::default()
        }
    }

    #[test]
    fn test_reflect_index() {
        assert_eq!(reflect_index(-1, 5), 1);
        assert_eq!(reflect_index(-4, 5), 4);
        assert_eq!(reflect_index(5, 5), 3);
        assert_eq!(reflect_index(2, 5), 2);
        // Ping-pong for pads longer than the signal
        assert_eq!(reflect_index(-6, 3), 2);
        assert_eq!(reflect_index(-7, 1), 0);
    }

    #[test]
    fn test_mel_scale_roundtrip_anchor() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((mel_to_hz(15.0) - 1000.0).abs() < 1e-9);
        assert!((mel_to_hz(hz_to_mel(4321.0)) - 4321.0).abs() < 1e-6);
    }

    #[test]
    fn test_filterbank_shape() {
        let filters = slaney_filterbank(16000, 2048, 80, 0.0, 8000.0);
        assert_eq!(filters.len(), 80);
        for pair in filters.windows(2) {
            assert!(pair[0].start_bin <= pair[1].start_bin);
        }
        for filter in &filters {
            assert!(filter.start_bin + filter.weights.len() <= 1025);
            assert!(filter.weights.iter().all(|&w| w >= 0.0));
        }
    }

    #[test]
    fn test_default_config_frame_math() {
        let config = MelConfig::default();
        assert_eq!(config.target_samples(), 512 * 512);
        let mel = MelSpectrogram::new(config).unwrap();
        // Centered framing yields one extra frame that gets trimmed.
        assert_eq!(mel.num_frames(512 * 512), 513);
    }

    #[test]
    fn test_power_to_db() {
        let mut values = vec![1.0, 0.1, 0.0];
        power_to_db(&mut values, Some(80.0));
        assert!(values[0].abs() < 1e-6);
        assert!((values[1] + 10.0).abs() < 1e-4);
        assert!((values[2] + 80.0).abs() < 1e-4);
    }

    #[test]
    fn test_power_to_db_without_top_db() {
        let mut values = vec![1.0, 0.0];
        power_to_db(&mut values, None);
        assert!((values[1] + 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_log_mel_frames_exact_shape() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        for len in [1usize, 100, 16 * 128, 10_000] {
            let samples: Vec<f32> = (0..len).map(|i| (i as f32 * 0.05).sin()).collect();
            let out = mel.log_mel_frames(&samples).unwrap();
            assert_eq!(out.len(), 16 * 40, "input length {}", len);
        }
    }

    #[test]
    fn test_silence_is_zero_db() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        let out = mel.log_mel_frames(&vec![0.0; 500]).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_tone_peaks_in_matching_band() {
        let config = small_config();
        let mel = MelSpectrogram::new(config.clone()).unwrap();
        let samples: Vec<f32> = (0..config.target_samples())
            .map(|i| (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 16000.0).sin())
            .collect();
        let out = mel.log_mel_frames(&samples).unwrap();

        let frame = &out[8 * config.n_mels..9 * config.n_mels];
        let (peak_band, _) = frame
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, &v)| {
                if v > acc.1 { (i, v) } else { acc }
            });

        let f_max = 8000.0;
        let edges: Vec<f64> = (0..config.n_mels + 2)
            .map(|i| mel_to_hz(hz_to_mel(f_max) * i as f64 / (config.n_mels + 1) as f64))
            .collect();
        assert!(edges[peak_band] <= 1000.0 && 1000.0 <= edges[peak_band + 2]);
        assert!(out.iter().all(|&v| (-80.0 - 1e-3..=1e-3).contains(&v)));
    }

    #[test]
    fn test_rejects_window_longer_than_fft() {
        let config = MelConfig {
            win_length: 4096,
            ..MelConfig::default()
        };
        assert!(MelSpectrogram::new(config).is_err());
    }

    #[test]
    fn test_rejects_odd_fft_size() {
        let config = MelConfig {
            n_fft: 255,
            win_length: 255,
            hop_length: 64,
            ..MelConfig::default()
        };
        let err = MelSpectrogram::new(config).unwrap_err();
        assert!(err.to_string().contains("even"));
    }

    #[test]
    fn test_periodic_hann_window() {
        let window = padded_hann_window(8, 8);
        let expected = [0.0, 0.1464466, 0.5, 0.8535534, 1.0, 0.8535534, 0.5, 0.1464466];
        for (w, e) in window.iter().zip(expected) {
            assert!((w - e).abs() < 1e-6, "{:?}", window);
        }
    }

    #[test]
    fn test_short_window_is_centered() {
        let window = padded_hann_window(4, 8);
        let expected = [0.0, 0.0, 0.0, 0.5, 1.0, 0.5, 0.0, 0.0];
        for (w, e) in window.iter().zip(expected) {
            assert!((w - e).abs() < 1e-6, "{:?}", window);
        }
    }

    #[test]
    fn test_filters_have_unit_area() {
        let filters = slaney_filterbank(16000, 2048, 80, 0.0, 8000.0);
        let bin_hz = 16000.0 / 2048.0;
        for (m, filter) in filters.iter().enumerate() {
            let area: f32 = filter.weights.iter().sum::<f32>() * bin_hz;
            assert!((area - 1.0).abs() < 1e-2, "filter {} area {}", m, area);
        }
    }

    #[test]
    fn test_filterbank_matches_reference_rows() {
        // librosa.filters.mel(sr=16000, n_fft=2048, n_mels=80), non-zero span of rows 0, 5, 40.
        let filters = slaney_filterbank(16000, 2048, 80, 0.0, 8000.0);
        let rows: [(usize, usize, &[f32]); 3] = [
            (
                0,
                1,
                &[
                    0.00563364019, 0.0112672804, 0.0169009206, 0.0225345608, 0.0255386308,
                    0.0199049906, 0.0142713504, 0.00863771024, 0.00300407006,
                ],
            ),
            (
                5,
                24,
                &[
                    0.00094028514, 0.00657392533, 0.0122075655, 0.0178412057, 0.0234748459,
                    0.0245983457, 0.0189647055, 0.0133310653, 0.0076974251, 0.00206378492,
                ],
            ),
            (
                40,
                213,
                &[
                    0.00169589031, 0.00351707403, 0.00533825775, 0.00715944147, 0.00898062519,
                    0.0108018089, 0.0126229926, 0.0144441763, 0.0140191854, 0.0122666163,
                    0.0105140472, 0.00876147812, 0.00700890904, 0.00525633996, 0.00350377088,
                    0.0017512018,
                ],
            ),
        ];
        for (m, start_bin, expected) in rows {
            let filter = &filters[m];
            assert_eq!(filter.start_bin, start_bin, "filter {}", m);
            assert_eq!(filter.weights.len(), expected.len(), "filter {}", m);
            for (w, e) in filter.weights.iter().zip(expected) {
                assert!((w - e).abs() < 1e-5, "filter {}: {} vs {}", m, w, e);
            }
        }
    }

    #[test]
    fn test_empty_clip_errors() {
        let mel = MelSpectrogram::new(small_config()).unwrap();
        assert!(mel.mel_power(&[]).is_err());
    }
}
