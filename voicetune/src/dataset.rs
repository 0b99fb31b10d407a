//! Metadata parsing and in-memory training dataset.

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::load_clip;
use crate::config::DataConfig;
use crate::processor::TextProcessor;
use crate::{Result, VoiceTuneError};

/// Raw CSV row as written by common TTS dataset tools.
#[derive(Debug, Deserialize)]
struct MetadataRow {
    #[serde(rename = "Audio Path")]
    audio_path: String,
    #[serde(rename = "Text")]
    text: String,
}

/// One `(audio, transcript)` pair from the metadata file.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRecord {
    /// Audio path relative to the dataset directory
    pub audio_path: PathBuf,
    pub text: String,
}

/// A prepared training sample
#[derive(Debug, Clone)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Peak-normalized waveform at the dataset sample rate
    pub labels: Vec<f32>,
    pub text: String,
}

/// Summary numbers for a prepared dataset
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStats {
    pub num_samples: usize,
    pub total_duration_secs: f32,
    pub min_duration_secs: f32,
    pub max_duration_secs: f32,
    pub mean_tokens: f32,
    pub max_tokens: usize,
}

/// Read the metadata CSV. Audio paths are trimmed and prefixed with `audio_subdir`.
pub fn read_metadata(path: impl AsRef<Path>, audio_subdir: &str) -> Result<Vec<MetadataRecord>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(VoiceTuneError::DatasetError(format!(
            "Metadata file not found: {}",
            path.display()
        )));
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let row: MetadataRow = row?;
        records.push(MetadataRecord {
            audio_path: Path::new(audio_subdir).join(row.audio_path.trim()),
            text: row.text,
        });
    }

    info!("✓ Read {} metadata rows from {}", records.len(), path.display());
    Ok(records)
}

/// Load and tokenize every record. Records whose audio is missing, empty or
/// unreadable, and records whose transcript encodes to no tokens, are skipped
/// with a warning.
pub fn prepare_dataset(
    records: &[MetadataRecord],
    dataset_dir: &Path,
    processor: &TextProcessor,
    config: &DataConfig,
) -> Result<TtsDataset> {
    info!("Processing audio files...");

    let mut samples = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        let full_path = dataset_dir.join(&record.audio_path);
        match load_clip(
            &full_path,
            config.sample_rate,
            Some(config.max_duration_secs),
        ) {
            Ok(mut audio) => {
                let encoding = processor.encode(&record.text)?;
                if encoding.input_ids.is_empty() {
                    warn!(
                        "Skipping {}: transcript {:?} has no tokens",
                        full_path.display(),
                        record.text
                    );
                    continue;
                }
                audio.normalize_peak();
                samples.push(Sample {
                    input_ids: encoding.input_ids,
                    attention_mask: encoding.attention_mask,
                    labels: audio.into_samples(),
                    text: record.text.clone(),
                });
            }
            Err(e) => warn!("Skipping {}: {}", full_path.display(), e),
        }

        if idx % 100 == 0 {
            info!("Processed {} files...", idx);
        }
    }

    if samples.is_empty() {
        return Err(VoiceTuneError::DatasetError(
            "No data was successfully processed".to_string(),
        ));
    }

    info!("Successfully processed {} files", samples.len());
    Ok(TtsDataset::new(samples, config.sample_rate))
}

/// Prepared samples held in memory
#[derive(Debug, Clone)]
pub struct TtsDataset {
    samples: Vec<Sample>,
    sample_rate: u32,
}

impl TtsDataset {
    pub fn new(samples: Vec<Sample>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Get number of samples in dataset
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if dataset is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Shuffle samples in place with a fixed seed
    pub fn shuffle(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        self.samples.shuffle(&mut rng);
    }

    /// Hold out `eval_fraction` of the samples for evaluation.
    ///
    /// At least one sample is always kept for training; no eval split is
    /// produced when the fraction is zero or the dataset is too small.
    pub fn split(mut self, eval_fraction: f32, seed: u64) -> (TtsDataset, Option<TtsDataset>) {
        if eval_fraction <= 0.0 {
            return (self, None);
        }
        if self.len() < 2 {
            warn!(
                "Dataset has {} sample(s), skipping eval split",
                self.len()
            );
            return (self, None);
        }

        self.shuffle(seed);
        let n_eval = ((self.len() as f32 * eval_fraction).round() as usize)
            .max(1)
            .min(self.len() - 1);
        let eval = self.samples.split_off(self.len() - n_eval);

        info!(
            "Split dataset: {} train / {} eval samples",
            self.samples.len(),
            eval.len()
        );
        let sample_rate = self.sample_rate;
        (self, Some(TtsDataset::new(eval, sample_rate)))
    }

    /// Iterate over batches in current order; the last batch may be short.
    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, Sample> {
        self.samples.chunks(batch_size.max(1))
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.samples.len().div_ceil(batch_size.max(1))
    }

    pub fn stats(&self) -> DatasetStats {
        let sr = self.sample_rate as f32;
        let durations: Vec<f32> = self
            .samples
            .iter()
            .map(|s| s.labels.len() as f32 / sr)
            .collect();
        let total_tokens: usize = self.samples.iter().map(|s| s.input_ids.len()).sum();

        DatasetStats {
            num_samples: self.samples.len(),
            total_duration_secs: durations.iter().sum(),
            min_duration_secs: durations.iter().cloned().fold(f32::INFINITY, f32::min),
            max_duration_secs: durations.iter().cloned().fold(0.0, f32::max),
            mean_tokens: total_tokens as f32 / self.samples.len().max(1) as f32,
            max_tokens: self
                .samples
                .iter()
                .map(|s| s.input_ids.len())
                .max()
                .unwrap_or(0),
        }
    }
}
