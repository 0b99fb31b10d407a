//! Model seam for fine-tuning and the bundled text-to-mel regressor.

use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder, VarMap, embedding, linear};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::collator::Batch;
use crate::utils::resolve_model_file;
use crate::{Result, VoiceTuneError};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// A text-to-spectrogram model the trainer can optimize.
pub trait SpeechModel {
    /// Predict log-mel frames `[batch, target_frames, n_mels]` from padded tokens.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn config(&self) -> &ModelConfig;

    /// Scalar training loss for a collated batch (mean absolute error).
    fn compute_loss(&self, batch: &Batch) -> Result<Tensor> {
        let predicted = self.forward(&batch.input_ids, &batch.attention_mask)?;
        if predicted.dims() != batch.labels.dims() {
            return Err(VoiceTuneError::TrainingError(format!(
                "Prediction shape {:?} does not match labels {:?}",
                predicted.dims(),
                batch.labels.dims()
            )));
        }
        Ok(predicted.sub(&batch.labels)?.abs()?.mean_all()?)
    }
}

/// Architecture hyperparameters, stored as `config.json` next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_mel_bins")]
    pub num_mel_bins: usize,
    #[serde(default = "default_target_frames")]
    pub target_frames: usize,
}

fn default_hidden_size() -> usize {
    256
}
fn default_num_mel_bins() -> usize {
    80
}
fn default_target_frames() -> usize {
    512
}

impl ModelConfig {
    pub fn new(vocab_size: usize, num_mel_bins: usize, target_frames: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: default_hidden_size(),
            num_mel_bins,
            target_frames,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            VoiceTuneError::ConfigError(format!("Failed to parse model config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0
            || self.hidden_size == 0
            || self.num_mel_bins == 0
            || self.target_frames == 0
        {
            return Err(VoiceTuneError::ConfigError(format!(
                "model dimensions must be positive: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Text-to-mel regressor.
///
/// Tokens are embedded and projected to keys/values; one learned query per
/// output frame attends over the (masked) text, and a two-layer head maps the
/// attended context to mel bins.
pub struct MelRegressor {
    embed: Embedding,
    key: Linear,
    value: Linear,
    frame_queries: Tensor,
    pre_head: Linear,
    mel_head: Linear,
    config: ModelConfig,
}

impl MelRegressor {
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let h = config.hidden_size;

        debug!(
            "Initializing MelRegressor: vocab={}, hidden={}, frames={}, mels={}",
            config.vocab_size, h, config.target_frames, config.num_mel_bins
        );

        let frame_queries = vb.get_with_hints(
            (config.target_frames, h),
            "frame_queries",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;

        Ok(Self {
            embed: embedding(config.vocab_size, h, vb.pp("embed_tokens"))?,
            key: linear(h, h, vb.pp("key"))?,
            value: linear(h, h, vb.pp("value"))?,
            frame_queries,
            pre_head: linear(h, h, vb.pp("pre_head"))?,
            mel_head: linear(h, config.num_mel_bins, vb.pp("mel_head"))?,
            config,
        })
    }

    /// Build a model with freshly initialized weights held in a new `VarMap`.
    pub fn init(config: ModelConfig, device: &Device) -> Result<(Self, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        Ok((model, varmap))
    }

    /// Load `config.json` + `model.safetensors` from a local directory or Hub repo.
    pub fn from_pretrained(source: &str, device: &Device) -> Result<(Self, VarMap)> {
        let config_path = resolve_model_file(source, CONFIG_FILE)?;
        let weights_path = resolve_model_file(source, WEIGHTS_FILE)?;

        let config = ModelConfig::from_file(&config_path)?;
        let (model, mut varmap) = Self::init(config, device)?;
        varmap.load(&weights_path).map_err(|e| {
            VoiceTuneError::InitializationError(format!(
                "Failed to load weights from {}: {}",
                weights_path.display(),
                e
            ))
        })?;

        info!("✓ Loaded pretrained weights from {}", source);
        Ok((model, varmap))
    }
}

impl SpeechModel for MelRegressor {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (batch, _seq_len) = input_ids.dims2()?;
        let (frames, hidden) = self.frame_queries.dims2()?;

        // [batch, seq_len, hidden]
        let text = self.embed.forward(input_ids)?;
        let keys = self.key.forward(&text)?;
        let values = self.value.forward(&text)?;

        // [batch, frames, hidden]
        let queries = self
            .frame_queries
            .unsqueeze(0)?
            .broadcast_as((batch, frames, hidden))?
            .contiguous()?;

        // [batch, frames, seq_len]
        let scores = queries
            .matmul(&keys.transpose(1, 2)?.contiguous()?)?
            .affine(1.0 / (hidden as f64).sqrt(), 0.0)?;

        // 0 for real tokens, -1e9 for padding
        let mask_bias = attention_mask
            .to_dtype(DType::F32)?
            .affine(1e9, -1e9)?
            .unsqueeze(1)?;
        let weights = candle_nn::ops::softmax(&scores.broadcast_add(&mask_bias)?, D::Minus1)?;

        let context = weights.matmul(&values)?;
        let hidden_states = self.pre_head.forward(&(context + queries)?)?.relu()?;
        Ok(self.mel_head.forward(&hidden_states)?)
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }
}

/// Write `model.safetensors` and `config.json` into `dir`.
pub fn save_weights(varmap: &VarMap, config: &ModelConfig, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    varmap.save(dir.join(WEIGHTS_FILE))?;
    config.save(dir.join(CONFIG_FILE))?;
    debug!("Saved weights to {}", dir.display());
    Ok(())
}
