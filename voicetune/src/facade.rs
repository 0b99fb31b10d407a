//! High-level fine-tuning API.

use std::path::{Path, PathBuf};

use candle_core::Device as CandleDevice;
use ndarray::Array2;
use serde::Serialize;
use tracing::{info, warn};

use crate::audio::load_clip;
use crate::collator::DataCollator;
use crate::config::FineTuneConfig;
use crate::dataset::{DatasetStats, TtsDataset, prepare_dataset, read_metadata};
use crate::mel::{MelConfig, MelSpectrogram};
use crate::model::{MelRegressor, ModelConfig, SpeechModel};
use crate::processor::TextProcessor;
use crate::trainer::{TrainSummary, Trainer};
use crate::utils::get_device;
use crate::{Result, VoiceTuneError};

/// Device selection for training.
#[derive(Debug, Clone, Default)]
pub enum Device {
    /// CUDA if available, then Metal, then CPU
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU with device ordinal
    Cuda(usize),
    /// Metal GPU (Apple Silicon)
    Metal,
}

impl Device {
    /// Pick the best available device at build time.
    pub fn auto() -> Self {
        Self::Auto
    }

    fn resolve(&self) -> Result<CandleDevice> {
        match self {
            Device::Auto => get_device(Some(0)),
            Device::Cpu => Ok(CandleDevice::Cpu),
            Device::Cuda(ordinal) => CandleDevice::new_cuda(*ordinal)
                .map_err(|e| VoiceTuneError::DeviceError(e.to_string())),
            Device::Metal => {
                CandleDevice::new_metal(0).map_err(|e| VoiceTuneError::DeviceError(e.to_string()))
            }
        }
    }
}

/// What a finished `run` produced
#[derive(Debug, Clone, Serialize)]
pub struct FineTuneReport {
    pub dataset: DatasetStats,
    pub eval_samples: usize,
    pub training: TrainSummary,
    pub final_model_dir: PathBuf,
}

/// Fine-tunes a text-to-mel model on a CSV + WAV dataset.
///
/// ```no_run
/// use voicetune::{Device, FineTuneConfig, FineTuner};
///
/// let tuner = FineTuner::builder()
///     .config(FineTuneConfig::default())
///     .tokenizer("./tokenizer.json")
///     .device(Device::Cpu)
///     .build()?;
/// let report = tuner.run()?;
/// println!("trained {} steps", report.training.global_step);
/// # Ok::<(), voicetune::VoiceTuneError>(())
/// ```
pub struct FineTuner {
    config: FineTuneConfig,
    device: CandleDevice,
    processor: TextProcessor,
    model_source: Option<String>,
    resume_from: Option<PathBuf>,
}

impl FineTuner {
    pub fn builder() -> FineTunerBuilder {
        FineTunerBuilder::new()
    }

    pub fn config(&self) -> &FineTuneConfig {
        &self.config
    }

    pub fn processor(&self) -> &TextProcessor {
        &self.processor
    }

    /// Read metadata and load every usable clip.
    pub fn load_dataset(&self) -> Result<TtsDataset> {
        let data = &self.config.data;
        let records = read_metadata(data.metadata_path(), &data.audio_subdir)?;
        prepare_dataset(&records, &data.dataset_dir, &self.processor, data)
    }

    /// Prepare the dataset without training and report its statistics.
    pub fn inspect(&self) -> Result<DatasetStats> {
        Ok(self.load_dataset()?.stats())
    }

    /// Prepare data, train, and write the model and tokenizer to
    /// `training.final_model_dir`.
    pub fn run(&self) -> Result<FineTuneReport> {
        let dataset = self.load_dataset()?;
        let stats = dataset.stats();
        info!(
            "Dataset: {} clips, {:.1}s of audio, {:.1} tokens/clip",
            stats.num_samples, stats.total_duration_secs, stats.mean_tokens
        );

        let training = &self.config.training;
        let (mut train_data, eval_data) =
            dataset.split(self.config.data.eval_fraction, training.seed);

        let (model, varmap) = self.load_model()?;
        let collator = DataCollator::new(
            self.processor.pad_token_id(),
            self.config.mel.clone(),
            &self.device,
        )?;

        let mut trainer = Trainer::new(model, varmap, collator, training.clone())?;
        if let Some(checkpoint) = &self.resume_from {
            trainer.resume_from(checkpoint)?;
        }

        let summary = trainer.train(&mut train_data, eval_data.as_ref())?;

        trainer.save_model(&training.final_model_dir)?;
        self.processor.save(&training.final_model_dir)?;
        info!(
            "✓ Fine-tuned model and tokenizer saved to {}",
            training.final_model_dir.display()
        );

        Ok(FineTuneReport {
            dataset: stats,
            eval_samples: eval_data.map(|d| d.len()).unwrap_or(0),
            training: summary,
            final_model_dir: training.final_model_dir.clone(),
        })
    }

    fn load_model(&self) -> Result<(MelRegressor, candle_nn::VarMap)> {
        seed_device(&self.device, self.config.training.seed);

        let (model, varmap) = match &self.model_source {
            Some(source) => {
                info!("Loading pretrained model from {}", source);
                MelRegressor::from_pretrained(source, &self.device)?
            }
            None => {
                let config = ModelConfig::new(
                    self.processor.vocab_size(),
                    self.config.mel.n_mels,
                    self.config.mel.target_frames,
                );
                info!(
                    "No pretrained model given, initializing a fresh one (vocab={}, hidden={})",
                    config.vocab_size, config.hidden_size
                );
                MelRegressor::init(config, &self.device)?
            }
        };

        if model.config().vocab_size < self.processor.vocab_size() {
            return Err(VoiceTuneError::InitializationError(format!(
                "Tokenizer has {} tokens but the model embeds only {}",
                self.processor.vocab_size(),
                model.config().vocab_size
            )));
        }
        Ok((model, varmap))
    }
}

/// Seed the device RNG used for weight init. Returns whether it took.
///
/// candle cannot seed its CPU generator, so fresh CPU models start from
/// unseeded weights; only GPU runs are reproducible.
fn seed_device(device: &CandleDevice, seed: u64) -> bool {
    match device.set_seed(seed) {
        Ok(()) => true,
        Err(e) => {
            warn!("Weight init is unseeded on {:?}: {}", device, e);
            false
        }
    }
}

pub struct FineTunerBuilder {
    config: FineTuneConfig,
    device: Device,
    model_source: Option<String>,
    tokenizer_source: Option<String>,
    resume_from: Option<PathBuf>,
}

impl Default for FineTunerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FineTunerBuilder {
    pub fn new() -> Self {
        Self {
            config: FineTuneConfig::default(),
            device: Device::Auto,
            model_source: None,
            tokenizer_source: None,
            resume_from: None,
        }
    }

    pub fn config(mut self, config: FineTuneConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Pretrained checkpoint: a local directory or a Hub repo id holding
    /// `config.json` and `model.safetensors`.
    pub fn model(mut self, source: impl Into<String>) -> Self {
        self.model_source = Some(source.into());
        self
    }

    /// `tokenizer.json` file, directory, or Hub repo. Defaults to the model source.
    pub fn tokenizer(mut self, source: impl Into<String>) -> Self {
        self.tokenizer_source = Some(source.into());
        self
    }

    /// Continue from a `checkpoint-{step}` directory.
    pub fn resume_from(mut self, checkpoint: impl Into<PathBuf>) -> Self {
        self.resume_from = Some(checkpoint.into());
        self
    }

    pub fn build(self) -> Result<FineTuner> {
        self.config.validate()?;

        if let Some(checkpoint) = &self.resume_from
            && !checkpoint.is_dir()
        {
            return Err(VoiceTuneError::ConfigError(format!(
                "Checkpoint directory not found: {}",
                checkpoint.display()
            )));
        }

        let device = self.device.resolve()?;

        let tokenizer_source = self
            .tokenizer_source
            .or_else(|| self.model_source.clone())
            .ok_or_else(|| {
                VoiceTuneError::ConfigError(
                    "A tokenizer source is required when no pretrained model is given"
                        .to_string(),
                )
            })?;
        let processor =
            TextProcessor::from_pretrained(&tokenizer_source, self.config.data.max_text_length)?;

        info!("✓ Fine-tuner ready on {:?}", device);
        Ok(FineTuner {
            config: self.config,
            device,
            processor,
            model_source: self.model_source,
            resume_from: self.resume_from,
        })
    }
}

/// Log-mel spectrogram `[target_frames, n_mels]` of one audio file, computed
/// the same way training labels are.
pub fn log_mel_from_file(path: impl AsRef<Path>, mel_config: &MelConfig) -> Result<Array2<f32>> {
    let mut audio = load_clip(path.as_ref(), mel_config.sample_rate, None)?;
    audio.normalize_peak();

    let mel = MelSpectrogram::new(mel_config.clone())?;
    let values = mel.log_mel_frames(audio.samples())?;
    if audio.num_samples() > mel_config.target_samples() {
        warn!(
            "{} is longer than {} frames, truncating",
            path.as_ref().display(),
            mel_config.target_frames
        );
    }

    Array2::from_shape_vec((mel_config.target_frames, mel_config.n_mels), values)
        .map_err(|e| VoiceTuneError::ProcessingError(e.to_string()))
}

/// Compute `log_mel_from_file` and write it as a `.npy` array.
pub fn write_log_mel_npy(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    mel_config: &MelConfig,
) -> Result<Array2<f32>> {
    let mel = log_mel_from_file(input, mel_config)?;
    ndarray_npy::write_npy(output.as_ref(), &mel).map_err(|e| {
        VoiceTuneError::IoError(format!(
            "Failed to write {}: {}",
            output.as_ref().display(),
            e
        ))
    })?;
    info!(
        "✓ Wrote {:?} log-mel to {}",
        mel.dim(),
        output.as_ref().display()
    );
    Ok(mel)
}
