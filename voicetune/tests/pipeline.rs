use std::path::Path;

use candle_core::Device as CandleDevice;
use voicetune::dataset::{prepare_dataset, read_metadata};
use voicetune::{
    DataCollator, Device, FineTuneConfig, FineTuner, MelConfig, MelRegressor, SpeechModel,
    TextProcessor,
};

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {
        "type": "WordLevel",
        "vocab": {"<unk>": 0, "<pad>": 1, "hello": 2, "world": 3, "good": 4, "morning": 5, "bye": 6},
        "unk_token": "<unk>"
    }
}"#;

fn write_wav(path: &Path, sample_rate: u32, seconds: f32, freq: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let n = (sample_rate as f32 * seconds) as usize;
    for i in 0..n {
        let t = i as f32 / sample_rate as f32;
        let s = (2.0 * std::f32::consts::PI * freq * t).sin() * 0.3;
        writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

/// Dataset with three readable clips (one needing resampling) and one
/// metadata row pointing at a missing file.
fn build_dataset(root: &Path) -> FineTuneConfig {
    let dataset_dir = root.join("dataset");
    let wavs = dataset_dir.join("wavs");
    std::fs::create_dir_all(&wavs).unwrap();

    write_wav(&wavs.join("a.wav"), 16000, 0.5, 220.0);
    write_wav(&wavs.join("b.wav"), 16000, 1.2, 440.0);
    write_wav(&wavs.join("c.wav"), 22050, 0.3, 330.0);
    std::fs::write(
        dataset_dir.join("metadata.csv"),
        "Audio Path,Text\n\
         a.wav,hello world\n\
         b.wav,\"good morning, world\"\n\
         c.wav,bye\n\
         missing.wav,hello again\n",
    )
    .unwrap();
    std::fs::write(root.join("tokenizer.json"), TOKENIZER_JSON).unwrap();

    let mut config = FineTuneConfig::default();
    config.data.dataset_dir = dataset_dir;
    config.data.max_text_length = 16;
    config.mel = MelConfig {
        n_fft: 256,
        win_length: 256,
        hop_length: 64,
        n_mels: 16,
        target_frames: 20,
        ..MelConfig::default()
    };
    config.training.output_dir = root.join("output");
    config.training.logging_dir = root.join("logs");
    config.training.final_model_dir = root.join("final");
    config.training.per_device_train_batch_size = 2;
    config.training.gradient_accumulation_steps = 1;
    config.training.num_train_epochs = 1;
    config.training.learning_rate = 1e-3;
    config.training.logging_steps = 1;
    config.training.eval_steps = 1;
    config.training.save_steps = 1;
    config
}

#[test]
fn test_prepare_and_collate() {
    let dir = tempfile::tempdir().unwrap();
    let config = build_dataset(dir.path());
    let processor = TextProcessor::from_file(dir.path().join("tokenizer.json"), 16).unwrap();

    let records = read_metadata(config.data.metadata_path(), &config.data.audio_subdir).unwrap();
    assert_eq!(records.len(), 4);

    let dataset =
        prepare_dataset(&records, &config.data.dataset_dir, &processor, &config.data).unwrap();
    assert_eq!(dataset.len(), 3);
    // The 22.05 kHz clip is resampled to 16 kHz
    let c = &dataset.samples()[2];
    assert!((c.labels.len() as i64 - 4800).abs() <= 2);
    let peak = c.labels.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    assert!((peak - 1.0).abs() < 1e-4);

    let collator = DataCollator::new(
        processor.pad_token_id(),
        config.mel.clone(),
        &CandleDevice::Cpu,
    )
    .unwrap();
    let batch = collator.collate(dataset.samples()).unwrap();
    assert_eq!(batch.input_ids.dims(), &[3, 4]);
    assert_eq!(batch.labels.dims(), &[3, 20, 16]);

    let ids = batch.input_ids.to_vec2::<u32>().unwrap();
    assert_eq!(ids[0], vec![2, 3, 1, 1]);
    assert_eq!(ids[1], vec![4, 5, 0, 3]);
    assert_eq!(ids[2], vec![6, 1, 1, 1]);
    let mask = batch.attention_mask.to_vec2::<u32>().unwrap();
    assert_eq!(mask[2], vec![1, 0, 0, 0]);
}

#[test]
fn test_empty_transcripts_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = build_dataset(dir.path());
    std::fs::write(
        config.data.metadata_path(),
        "Audio Path,Text\n\
         a.wav,\"\"\n\
         b.wav,hello\n\
         c.wav,\"   \"\n",
    )
    .unwrap();
    let processor = TextProcessor::from_file(dir.path().join("tokenizer.json"), 16).unwrap();

    let records = read_metadata(config.data.metadata_path(), &config.data.audio_subdir).unwrap();
    assert_eq!(records.len(), 3);
    let dataset =
        prepare_dataset(&records, &config.data.dataset_dir, &processor, &config.data).unwrap();
    assert_eq!(dataset.len(), 1);
    assert_eq!(dataset.samples()[0].input_ids, vec![2]);

    // Every batch still has at least one real token to pad against.
    let collator = DataCollator::new(
        processor.pad_token_id(),
        config.mel.clone(),
        &CandleDevice::Cpu,
    )
    .unwrap();
    let batch = collator.collate(dataset.samples()).unwrap();
    assert_eq!(batch.input_ids.dims(), &[1, 1]);
}

#[test]
fn test_fine_tune_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = build_dataset(dir.path());
    let tokenizer = dir.path().join("tokenizer.json");

    let tuner = FineTuner::builder()
        .config(config.clone())
        .tokenizer(tokenizer.to_str().unwrap())
        .device(Device::Cpu)
        .build()
        .unwrap();

    let stats = tuner.inspect().unwrap();
    assert_eq!(stats.num_samples, 3);
    assert_eq!(stats.max_tokens, 4);

    let report = tuner.run().unwrap();
    // 3 clips, batch size 2: two optimizer steps
    assert_eq!(report.training.global_step, 2);
    assert!(report.training.train_loss.is_finite());
    assert_eq!(report.eval_samples, 0);

    let output = dir.path().join("output");
    assert!(output.join("checkpoint-1/model.safetensors").exists());
    assert!(output.join("checkpoint-2/trainer_state.json").exists());

    let final_dir = dir.path().join("final");
    for file in ["model.safetensors", "config.json", "tokenizer.json"] {
        assert!(final_dir.join(file).exists(), "missing {}", file);
    }

    let (model, _) =
        MelRegressor::from_pretrained(final_dir.to_str().unwrap(), &CandleDevice::Cpu).unwrap();
    assert_eq!(model.config().target_frames, 20);
    assert_eq!(model.config().num_mel_bins, 16);
    let reloaded = TextProcessor::from_file(final_dir.join("tokenizer.json"), 16).unwrap();
    assert_eq!(reloaded.encode("hello world").unwrap().input_ids, vec![2, 3]);
}

#[test]
fn test_resume_and_continue_from_pretrained() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = build_dataset(dir.path());
    let tokenizer = dir.path().join("tokenizer.json");

    FineTuner::builder()
        .config(config.clone())
        .tokenizer(tokenizer.to_str().unwrap())
        .device(Device::Cpu)
        .build()
        .unwrap()
        .run()
        .unwrap();

    // Second run: continue from the first run's checkpoint,
    // loading the model from the exported directory and holding out a clip.
    config.training.num_train_epochs = 3;
    config.data.eval_fraction = 0.34;
    let final_dir = dir.path().join("final");
    config.training.final_model_dir = dir.path().join("final2");

    let report = FineTuner::builder()
        .config(config)
        .model(final_dir.to_str().unwrap())
        .resume_from(dir.path().join("output/checkpoint-2"))
        .device(Device::Cpu)
        .build()
        .unwrap()
        .run()
        .unwrap();

    // Two training clips at batch size 2 give one step per epoch, so resuming
    // at step 2 leaves only the third epoch.
    assert_eq!(report.eval_samples, 1);
    assert_eq!(report.training.global_step, 3);
    assert_eq!(report.training.epochs, 3);
    assert!(report.training.final_eval_loss.is_some());
    assert!(dir.path().join("final2/model.safetensors").exists());
}

#[test]
fn test_missing_metadata_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    let mut config = FineTuneConfig::default();
    config.data.dataset_dir = dir.path().join("nowhere");

    let tuner = FineTuner::builder()
        .config(config)
        .tokenizer(dir.path().join("tokenizer.json").to_str().unwrap())
        .device(Device::Cpu)
        .build()
        .unwrap();
    assert!(tuner.run().is_err());
}
