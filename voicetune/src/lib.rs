//! voicetune: fine-tune a text-to-speech model on your own recordings.
//!
//! A dataset is a directory with a `metadata.csv` (`Audio Path`, `Text`)
//! and a folder of WAV clips. Clips are loaded, resampled to 16 kHz and
//! peak-normalized; transcripts are tokenized; the collator pads tokens and
//! turns each waveform into a fixed `[512, 80]` log-mel target.
//!
//! # Quick Start
//!
//! ```no_run
//! use voicetune::{Device, FineTuneConfig, FineTuner};
//!
//! let config = FineTuneConfig::from_file("finetune.json")?;
//! let report = FineTuner::builder()
//!     .config(config)
//!     .model("./base_model")
//!     .device(Device::auto())
//!     .build()?
//!     .run()?;
//! println!("final loss {:.4}", report.training.train_loss);
//! # Ok::<(), voicetune::VoiceTuneError>(())
//! ```
//!
//! # Collating by hand
//!
//! ```no_run
//! use voicetune::{DataCollator, MelConfig, TextProcessor};
//! use voicetune::dataset::{prepare_dataset, read_metadata};
//!
//! let config = voicetune::FineTuneConfig::default();
//! let processor = TextProcessor::from_file("tokenizer.json", 256)?;
//! let records = read_metadata(config.data.metadata_path(), "wavs")?;
//! let dataset = prepare_dataset(&records, &config.data.dataset_dir, &processor, &config.data)?;
//!
//! let collator = DataCollator::new(processor.pad_token_id(), MelConfig::default(), &candle_core::Device::Cpu)?;
//! let batch = collator.collate(&dataset.samples()[..2])?;
//! assert_eq!(batch.labels.dims(), &[2, 512, 80]);
//! # Ok::<(), voicetune::VoiceTuneError>(())
//! ```

mod error;
mod facade;

pub mod audio;
pub mod collator;
pub mod config;
pub mod dataset;
pub mod lr_scheduler;
pub mod mel;
pub mod model;
pub mod processor;
pub mod trainer;
pub mod utils;

pub use audio::AudioData;
pub use collator::{Batch, DataCollator};
pub use config::{DataConfig, FineTuneConfig, TrainingConfig};
pub use dataset::{DatasetStats, Sample, TtsDataset};
pub use error::{Result, VoiceTuneError};
pub use facade::{
    Device, FineTuneReport, FineTuner, FineTunerBuilder, log_mel_from_file, write_log_mel_npy,
};
pub use mel::{MelConfig, MelSpectrogram};
pub use model::{MelRegressor, ModelConfig, SpeechModel};
pub use processor::TextProcessor;
pub use trainer::{TrainSummary, Trainer, TrainingState};
