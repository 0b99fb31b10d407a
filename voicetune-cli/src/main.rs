use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use voicetune::{
    Device, FineTuneConfig, FineTuner, MelConfig, utils::init_logging, write_log_mel_npy,
};

#[derive(Parser, Debug)]
#[command(name = "voicetune")]
#[command(
    author,
    version,
    about = "Fine-tune a text-to-speech model on your own recordings"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    train: TrainArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the log-mel training target of one WAV file as .npy
    Mel {
        /// Input WAV file
        input: PathBuf,
        /// Output .npy file ([frames, n_mels] float32)
        output: PathBuf,
        /// JSON config file whose `mel` section sets the extraction parameters
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of output frames
        #[arg(long)]
        target_frames: Option<usize>,
    },
    /// Load the dataset and print its statistics without training
    Inspect {
        #[command(flatten)]
        train: TrainArgs,
    },
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding metadata.csv and the wavs/ folder
    #[arg(short, long)]
    dataset_dir: Option<PathBuf>,

    /// Directory for intermediate checkpoints
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Directory for the final model and tokenizer
    #[arg(long)]
    final_model_dir: Option<PathBuf>,

    /// Pretrained model: local directory or HuggingFace repo id
    #[arg(short, long)]
    model: Option<String>,

    /// tokenizer.json file, directory or repo id (defaults to --model)
    #[arg(short, long)]
    tokenizer: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    /// Per-device batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Gradient accumulation steps
    #[arg(long)]
    grad_accum: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Fixed number of mel frames per clip
    #[arg(long)]
    target_frames: Option<usize>,

    /// Share of clips held out for evaluation
    #[arg(long)]
    eval_fraction: Option<f32>,

    /// Resume from a checkpoint-{step} directory
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Force CPU even if a GPU is available
    #[arg(long)]
    cpu: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Write logs to a file under the logging dir instead of stderr
    #[arg(long)]
    log_file: bool,
}

impl TrainArgs {
    fn load_config(&self) -> Result<FineTuneConfig> {
        let mut config = match &self.config {
            Some(path) => FineTuneConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => FineTuneConfig::default(),
        };

        let data = &mut config.data;
        if let Some(dir) = &self.dataset_dir {
            data.dataset_dir = dir.clone();
        }
        if let Some(fraction) = self.eval_fraction {
            data.eval_fraction = fraction;
        }

        let training = &mut config.training;
        if let Some(dir) = &self.output_dir {
            training.output_dir = dir.clone();
        }
        if let Some(dir) = &self.final_model_dir {
            training.final_model_dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            training.num_train_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            training.per_device_train_batch_size = batch_size;
        }
        if let Some(accum) = self.grad_accum {
            training.gradient_accumulation_steps = accum;
        }
        if let Some(lr) = self.learning_rate {
            training.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            training.seed = seed;
        }
        if let Some(frames) = self.target_frames {
            config.mel.target_frames = frames;
        }

        config.validate()?;
        Ok(config)
    }

    fn build(&self, config: FineTuneConfig) -> Result<FineTuner> {
        let device = if self.cpu { Device::Cpu } else { Device::auto() };
        let mut builder = FineTuner::builder().config(config).device(device);
        if let Some(model) = &self.model {
            builder = builder.model(model);
        }
        if let Some(tokenizer) = &self.tokenizer {
            builder = builder.tokenizer(tokenizer);
        }
        if let Some(checkpoint) = &self.resume {
            builder = builder.resume_from(checkpoint);
        }
        Ok(builder.build()?)
    }

    fn init_logging(&self, config: &FineTuneConfig) -> Result<()> {
        let log_dir = self
            .log_file
            .then_some(config.training.logging_dir.as_path());
        init_logging(log_dir, "voicetune")?;
        Ok(())
    }
}

/// Mel parameters for the `mel` subcommand: the config file's `mel` section
/// (or defaults), then the frame override.
fn mel_config(config: Option<&Path>, target_frames: Option<usize>) -> Result<MelConfig> {
    let mut mel = match config {
        Some(path) => {
            FineTuneConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?
                .mel
        }
        None => MelConfig::default(),
    };
    if let Some(frames) = target_frames {
        mel.target_frames = frames;
    }
    Ok(mel)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        return match command {
            Commands::Mel {
                input,
                output,
                config,
                target_frames,
            } => {
                init_logging(None, "voicetune")?;
                let mel_config = mel_config(config.as_deref(), target_frames)?;
                write_log_mel_npy(&input, &output, &mel_config)?;
                Ok(())
            }
            Commands::Inspect { train } => {
                let config = train.load_config()?;
                train.init_logging(&config)?;

                info!("Dataset inspection");
                info!("────────────────────────────────────────────");
                let tuner = train.build(config)?;
                let stats = tuner.inspect()?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                Ok(())
            }
        };
    }

    let args = cli.train;
    let config = args.load_config()?;
    args.init_logging(&config)?;

    info!("voicetune fine-tuning");
    info!("────────────────────────────────────────────");
    info!("Dataset: {}", config.data.metadata_path().display());
    info!("Output: {}", config.training.output_dir.display());
    if let Some(model) = &args.model {
        info!("Base model: {}", model);
    }

    let tuner = args.build(config)?;
    let report = tuner.run()?;

    info!("────────────────────────────────────────────");
    info!(
        "Done: {} steps over {} epochs, train loss {:.4}{}",
        report.training.global_step,
        report.training.epochs,
        report.training.train_loss,
        report
            .training
            .final_eval_loss
            .map(|l| format!(", eval loss {:.4}", l))
            .unwrap_or_default()
    );
    info!("Saved: {}", report.final_model_dir.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_config_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finetune.json");
        std::fs::write(
            &path,
            r#"{"mel": {"n_fft": 1024, "win_length": 1024, "hop_length": 256, "n_mels": 40}}"#,
        )
        .unwrap();

        let mel = mel_config(Some(&path), Some(64)).unwrap();
        assert_eq!(mel.n_fft, 1024);
        assert_eq!(mel.hop_length, 256);
        assert_eq!(mel.n_mels, 40);
        assert_eq!(mel.target_frames, 64);
    }

    #[test]
    fn test_mel_config_defaults_without_file() {
        let mel = mel_config(None, None).unwrap();
        assert_eq!(mel, MelConfig::default());
    }

    #[test]
    fn test_mel_subcommand_parses_config_flag() {
        let cli = Cli::try_parse_from([
            "voicetune",
            "mel",
            "clip.wav",
            "clip.npy",
            "--config",
            "finetune.json",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Mel { config, .. }) => {
                assert_eq!(config, Some(PathBuf::from("finetune.json")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
