use crate::mel::MelConfig;
use crate::{Result, VoiceTuneError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Top-level fine-tuning config with nested sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    pub data: DataConfig,
    pub mel: MelConfig,
    pub training: TrainingConfig,
}

impl FineTuneConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VoiceTuneError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        debug!("✓ Loaded configuration from {}", path.display());
        debug!(
            "  Data: dir={:?}, sr={}, max_duration={}s",
            config.data.dataset_dir, config.data.sample_rate, config.data.max_duration_secs
        );
        debug!(
            "  Mel: n_fft={}, hop={}, n_mels={}, frames={}",
            config.mel.n_fft, config.mel.hop_length, config.mel.n_mels, config.mel.target_frames
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.mel.validate()?;
        self.training.validate()?;

        if self.data.sample_rate != self.mel.sample_rate {
            return Err(VoiceTuneError::ConfigError(format!(
                "data sample_rate {} does not match mel sample_rate {}",
                self.data.sample_rate, self.mel.sample_rate
            )));
        }
        Ok(())
    }
}

/// Dataset location and per-clip preprocessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory holding the metadata file and audio folder
    pub dataset_dir: PathBuf,
    /// CSV with "Audio Path" and "Text" columns, relative to `dataset_dir`
    pub metadata_file: String,
    /// Folder prefixed to every audio path in the metadata
    pub audio_subdir: String,
    pub sample_rate: u32,
    /// Clips are cut to this many seconds on load
    pub max_duration_secs: f32,
    pub max_text_length: usize,
    /// Share of samples held out for evaluation (0 disables evaluation)
    pub eval_fraction: f32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset"),
            metadata_file: "metadata.csv".to_string(),
            audio_subdir: "wavs".to_string(),
            sample_rate: 16000,
            max_duration_secs: 10.0,
            max_text_length: 256,
            eval_fraction: 0.0,
        }
    }
}

impl DataConfig {
    pub fn metadata_path(&self) -> PathBuf {
        self.dataset_dir.join(&self.metadata_file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(VoiceTuneError::ConfigError(
                "sample_rate must be positive".to_string(),
            ));
        }
        if self.max_duration_secs <= 0.0 {
            return Err(VoiceTuneError::ConfigError(format!(
                "max_duration_secs must be positive, got {}",
                self.max_duration_secs
            )));
        }
        if self.max_text_length == 0 {
            return Err(VoiceTuneError::ConfigError(
                "max_text_length must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.eval_fraction) {
            return Err(VoiceTuneError::ConfigError(format!(
                "eval_fraction must be in [0, 1), got {}",
                self.eval_fraction
            )));
        }
        Ok(())
    }
}

/// Optimization, schedule and checkpointing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // === Output ===
    /// Directory for intermediate checkpoints
    pub output_dir: PathBuf,
    /// Directory for log files
    pub logging_dir: PathBuf,
    /// Directory the final model and tokenizer are written to
    pub final_model_dir: PathBuf,

    // === Batching ===
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub num_train_epochs: usize,
    /// Reshuffle training samples at each epoch
    pub shuffle: bool,
    pub seed: u64,

    // === Optimization ===
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    /// Global gradient norm clip (0 disables clipping)
    pub max_grad_norm: f64,
    pub warmup_steps: usize,

    // === Cadence (optimizer steps) ===
    pub logging_steps: usize,
    pub eval_steps: usize,
    pub save_steps: usize,
    /// Keep only this many checkpoints (None = keep all)
    pub save_total_limit: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            logging_dir: PathBuf::from("./logs"),
            final_model_dir: PathBuf::from("./fine_tuned_model"),

            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 4,
            num_train_epochs: 3,
            shuffle: true,
            seed: 42,

            learning_rate: 5e-5,
            weight_decay: 0.01,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            warmup_steps: 0,

            logging_steps: 500,
            eval_steps: 500,
            save_steps: 500,
            save_total_limit: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 {
            return Err(VoiceTuneError::ConfigError(
                "per_device_train_batch_size must be positive".to_string(),
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(VoiceTuneError::ConfigError(
                "gradient_accumulation_steps must be positive".to_string(),
            ));
        }
        if self.num_train_epochs == 0 {
            return Err(VoiceTuneError::ConfigError(
                "num_train_epochs must be positive".to_string(),
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(VoiceTuneError::ConfigError(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.logging_steps == 0 || self.eval_steps == 0 || self.save_steps == 0 {
            return Err(VoiceTuneError::ConfigError(
                "logging/eval/save step intervals must be positive".to_string(),
            ));
        }
        if self.save_total_limit == Some(0) {
            return Err(VoiceTuneError::ConfigError(
                "save_total_limit must be at least 1 when set".to_string(),
            ));
        }
        if self.learning_rate > 1e-2 {
            warn!(
                "⚠️  learning_rate {} is unusually high for fine-tuning",
                self.learning_rate
            );
        }
        Ok(())
    }

    /// Samples consumed per optimizer step.
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }
}
