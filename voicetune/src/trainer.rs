//! Fine-tuning loop: gradient accumulation, clipping, AdamW with a linear
//! schedule, periodic evaluation and rotating checkpoints.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collator::DataCollator;
use crate::config::TrainingConfig;
use crate::dataset::TtsDataset;
use crate::lr_scheduler::{LRScheduler, LinearScheduler};
use crate::model::{SpeechModel, WEIGHTS_FILE, save_weights};
use crate::{Result, VoiceTuneError};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One logged point of the training history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f32>,
    pub learning_rate: f64,
}

/// Progress persisted next to every checkpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Optimizer steps taken so far
    pub step: usize,
    /// Epochs fully completed
    pub epoch: usize,
    pub best_eval_loss: Option<f32>,
    pub log_history: Vec<LogEntry>,
}

impl TrainingState {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Result of a finished `train` call
#[derive(Debug, Clone, Serialize)]
pub struct TrainSummary {
    pub global_step: usize,
    pub epochs: usize,
    /// Mean micro-batch loss over this run
    pub train_loss: f32,
    pub final_eval_loss: Option<f32>,
    pub elapsed_secs: f64,
}

pub struct Trainer<M: SpeechModel> {
    model: M,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    collator: DataCollator,
    config: TrainingConfig,
    state: TrainingState,
}

impl<M: SpeechModel> Trainer<M> {
    pub fn new(
        model: M,
        varmap: VarMap,
        collator: DataCollator,
        config: TrainingConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mel = collator.mel_config();
        let model_config = model.config();
        if model_config.target_frames != mel.target_frames
            || model_config.num_mel_bins != mel.n_mels
        {
            return Err(VoiceTuneError::ConfigError(format!(
                "model predicts {}x{} frames but collator produces {}x{}",
                model_config.target_frames,
                model_config.num_mel_bins,
                mel.target_frames,
                mel.n_mels
            )));
        }

        let vars = varmap.all_vars();
        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            eps: config.adam_epsilon,
            weight_decay: config.weight_decay,
        };
        let optimizer = AdamW::new(vars.clone(), params)?;

        let num_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        info!(
            "✓ Trainer ready: {} tensors, {} parameters",
            vars.len(),
            num_params
        );

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            collator,
            config,
            state: TrainingState::default(),
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Restore weights and progress from a `checkpoint-{step}` directory.
    ///
    /// Optimizer moments are not persisted; AdamW restarts from zero state.
    pub fn resume_from(&mut self, checkpoint: impl AsRef<Path>) -> Result<()> {
        let checkpoint = checkpoint.as_ref();
        let weights = checkpoint.join(WEIGHTS_FILE);
        self.varmap.load(&weights).map_err(|e| {
            VoiceTuneError::InitializationError(format!(
                "Failed to load checkpoint weights {}: {}",
                weights.display(),
                e
            ))
        })?;
        self.state = TrainingState::load(checkpoint.join(TRAINER_STATE_FILE))?;

        info!(
            "✓ Resumed from {} at step {} (epoch {})",
            checkpoint.display(),
            self.state.step,
            self.state.epoch
        );
        Ok(())
    }

    /// Mean loss over `dataset` without updating weights.
    pub fn evaluate(&self, dataset: &TtsDataset) -> Result<f32> {
        let mut total = 0.0f32;
        let mut count = 0usize;
        for samples in dataset.batches(self.config.per_device_train_batch_size) {
            let batch = self.collator.collate(samples)?;
            let loss = self.model.compute_loss(&batch)?.to_scalar::<f32>()?;
            total += loss;
            count += 1;
        }
        if count == 0 {
            return Err(VoiceTuneError::TrainingError(
                "Evaluation dataset is empty".to_string(),
            ));
        }
        Ok(total / count as f32)
    }

    pub fn train(
        &mut self,
        train_data: &mut TtsDataset,
        eval_data: Option<&TtsDataset>,
    ) -> Result<TrainSummary> {
        if train_data.is_empty() {
            return Err(VoiceTuneError::TrainingError(
                "Training dataset is empty".to_string(),
            ));
        }

        let batch_size = self.config.per_device_train_batch_size;
        let accum = self.config.gradient_accumulation_steps;
        let epochs = self.config.num_train_epochs;
        let batches_per_epoch = train_data.num_batches(batch_size);
        let steps_per_epoch = batches_per_epoch.div_ceil(accum);
        let total_steps = steps_per_epoch * epochs;

        let mut scheduler =
            LinearScheduler::new(self.config.learning_rate, self.config.warmup_steps, total_steps);
        scheduler.set_step(self.state.step);

        info!("Starting training...");
        info!("  Samples: {}", train_data.len());
        info!("  Epochs: {}", epochs);
        info!(
            "  Batch size: {} x {} accumulation = {}",
            batch_size,
            accum,
            self.config.effective_batch_size()
        );
        info!("  Optimizer steps: {}", total_steps);
        info!("  Learning rate: {:.2e}", self.config.learning_rate);

        std::fs::create_dir_all(&self.config.output_dir)?;

        let start_epoch = self.state.step / steps_per_epoch.max(1);
        let mut skip_batches = (self.state.step % steps_per_epoch.max(1)) * accum;
        if self.config.shuffle {
            // Replay earlier epochs' shuffles so a resumed run sees the same order.
            for epoch in 0..start_epoch {
                train_data.shuffle(self.config.seed + epoch as u64);
            }
        }

        let start_time = Instant::now();
        let mut run_loss_sum = 0.0f32;
        let mut run_loss_count = 0usize;
        let mut window_loss_sum = 0.0f32;
        let mut window_steps = 0usize;
        let mut last_eval = None;

        for epoch in start_epoch..epochs {
            if self.config.shuffle {
                train_data.shuffle(self.config.seed + epoch as u64);
            }
            info!("Epoch {}/{}", epoch + 1, epochs);

            let mut accumulated: Option<GradStore> = None;
            let mut micro_losses = 0.0f32;
            let mut micro_count = 0usize;

            for (idx, samples) in train_data.batches(batch_size).enumerate() {
                if skip_batches > 0 {
                    skip_batches -= 1;
                    continue;
                }

                let batch = self.collator.collate(samples)?;
                let loss = self.model.compute_loss(&batch)?;
                let loss_value = loss.to_scalar::<f32>()?;
                if !loss_value.is_finite() {
                    return Err(VoiceTuneError::TrainingError(format!(
                        "Non-finite loss {} at step {}",
                        loss_value, self.state.step
                    )));
                }

                let grads = loss.affine(1.0 / accum as f64, 0.0)?.backward()?;
                accumulated = Some(accumulate_grads(&self.vars, accumulated, grads)?);
                micro_losses += loss_value;
                micro_count += 1;
                run_loss_sum += loss_value;
                run_loss_count += 1;

                let end_of_group = (idx + 1) % accum == 0 || idx + 1 == batches_per_epoch;
                if !end_of_group {
                    continue;
                }

                let Some(mut grads) = accumulated.take() else {
                    continue;
                };
                let grad_norm = clip_grad_norm(&self.vars, &mut grads, self.config.max_grad_norm)?;
                let lr = scheduler.get_lr();
                self.optimizer.set_learning_rate(lr);
                self.optimizer.step(&grads)?;
                scheduler.step();
                self.state.step += 1;

                let step_loss = micro_losses / micro_count as f32;
                micro_losses = 0.0;
                micro_count = 0;
                window_loss_sum += step_loss;
                window_steps += 1;
                debug!(
                    "step {} loss={:.4} grad_norm={:.4} lr={:.2e}",
                    self.state.step, step_loss, grad_norm, lr
                );

                if self.state.step % self.config.logging_steps == 0 {
                    let mean = window_loss_sum / window_steps as f32;
                    info!(
                        "  Step {}/{}: loss={:.4}, lr={:.2e}, time={:.1}s",
                        self.state.step,
                        total_steps,
                        mean,
                        lr,
                        start_time.elapsed().as_secs_f64()
                    );
                    self.state.log_history.push(LogEntry {
                        step: self.state.step,
                        epoch,
                        loss: Some(mean),
                        eval_loss: None,
                        learning_rate: lr,
                    });
                    window_loss_sum = 0.0;
                    window_steps = 0;
                }

                if let Some(eval_data) = eval_data
                    && self.state.step % self.config.eval_steps == 0
                {
                    last_eval = Some(self.run_eval(eval_data, epoch, lr)?);
                }

                if self.state.step % self.config.save_steps == 0 {
                    self.save_checkpoint()?;
                }
            }

            self.state.epoch = epoch + 1;
        }

        let final_eval_loss = match eval_data {
            Some(eval_data) if last_eval.is_none() || self.state.step % self.config.eval_steps != 0 => {
                Some(self.run_eval(eval_data, self.state.epoch, scheduler.get_lr())?)
            }
            _ => last_eval,
        };

        let elapsed_secs = start_time.elapsed().as_secs_f64();
        let train_loss = if run_loss_count > 0 {
            run_loss_sum / run_loss_count as f32
        } else {
            warn!("No batches were trained in this run");
            0.0
        };
        info!(
            "✓ Training complete: {} steps, loss={:.4}, {:.1}s",
            self.state.step, train_loss, elapsed_secs
        );

        Ok(TrainSummary {
            global_step: self.state.step,
            epochs: self.state.epoch,
            train_loss,
            final_eval_loss,
            elapsed_secs,
        })
    }

    fn run_eval(&mut self, eval_data: &TtsDataset, epoch: usize, lr: f64) -> Result<f32> {
        let eval_loss = self.evaluate(eval_data)?;
        let improved = self.state.best_eval_loss.is_none_or(|best| eval_loss < best);
        if improved {
            self.state.best_eval_loss = Some(eval_loss);
        }
        info!(
            "  Eval at step {}: loss={:.4}{}",
            self.state.step,
            eval_loss,
            if improved { " (best)" } else { "" }
        );
        self.state.log_history.push(LogEntry {
            step: self.state.step,
            epoch,
            loss: None,
            eval_loss: Some(eval_loss),
            learning_rate: lr,
        });
        Ok(eval_loss)
    }

    /// Write `checkpoint-{step}` under `output_dir` and prune old ones.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let dir = self
            .config
            .output_dir
            .join(format!("{}{}", CHECKPOINT_PREFIX, self.state.step));
        save_weights(&self.varmap, self.model.config(), &dir)?;
        self.state.save(dir.join(TRAINER_STATE_FILE))?;
        info!("  Saved checkpoint: {}", dir.display());

        if let Some(limit) = self.config.save_total_limit {
            rotate_checkpoints(&self.config.output_dir, limit)?;
        }
        Ok(dir)
    }

    /// Write `model.safetensors` and `config.json` into `dir`.
    pub fn save_model(&self, dir: impl AsRef<Path>) -> Result<()> {
        save_weights(&self.varmap, self.model.config(), dir.as_ref())?;
        info!("✓ Model saved to {}", dir.as_ref().display());
        Ok(())
    }
}

/// Add `grads` into `acc` for every trainable var.
fn accumulate_grads(vars: &[Var], acc: Option<GradStore>, grads: GradStore) -> Result<GradStore> {
    let Some(mut acc) = acc else {
        return Ok(grads);
    };
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => prev.add(grad)?,
                None => grad.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
    }
    Ok(acc)
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping; `max_norm <= 0` disables clipping.
fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = sum_sq.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let scaled = grad.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}

/// Keep the `limit` highest-numbered `checkpoint-*` directories.
fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<()> {
    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(output_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            let step = name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()?;
            Some((step, e.path()))
        })
        .collect();

    checkpoints.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in checkpoints.iter().skip(limit) {
        debug!("Removing old checkpoint {}", path.display());
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}
