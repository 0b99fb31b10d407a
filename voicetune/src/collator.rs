//! Batch collation: pads token sequences and turns waveforms into fixed-size
//! log-mel targets.
//!
//! Output shapes are always `(batch, max_len)` for `input_ids` and
//! `attention_mask`, and `(batch, target_frames, n_mels)` for `labels`.

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::dataset::Sample;
use crate::mel::{MelConfig, MelSpectrogram};
use crate::{Result, VoiceTuneError};

/// A collated training batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token ids [batch, max_len], u32
    pub input_ids: Tensor,
    /// 1 for real tokens, 0 for padding [batch, max_len], u32
    pub attention_mask: Tensor,
    /// Log-mel targets [batch, target_frames, n_mels], f32
    pub labels: Tensor,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

pub struct DataCollator {
    pad_token_id: u32,
    mel: MelSpectrogram,
    device: Device,
}

impl DataCollator {
    pub fn new(pad_token_id: u32, mel_config: MelConfig, device: &Device) -> Result<Self> {
        Ok(Self {
            pad_token_id,
            mel: MelSpectrogram::new(mel_config)?,
            device: device.clone(),
        })
    }

    pub fn mel_config(&self) -> &MelConfig {
        self.mel.config()
    }

    pub fn collate(&self, samples: &[Sample]) -> Result<Batch> {
        if samples.is_empty() {
            return Err(VoiceTuneError::ProcessingError(
                "Cannot collate an empty batch".to_string(),
            ));
        }

        let (ids, mask, max_len) = self.pad_text(samples)?;
        let batch_size = samples.len();
        let input_ids = Tensor::from_vec(ids, (batch_size, max_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (batch_size, max_len), &self.device)?;

        let frames = self.mel.config().target_frames;
        let n_mels = self.mel.config().n_mels;
        let mut mels = Vec::with_capacity(batch_size * frames * n_mels);
        for sample in samples {
            mels.extend(self.mel.log_mel_frames(&sample.labels)?);
        }
        let labels = Tensor::from_vec(mels, (batch_size, frames, n_mels), &self.device)?;

        debug!(
            "Collated batch: ids={:?}, labels={:?}",
            input_ids.dims(),
            labels.dims()
        );

        Ok(Batch {
            input_ids,
            attention_mask,
            labels,
        })
    }

    /// Right-pad ids with the pad token and masks with zero to the longest
    /// sequence in the batch. Returns flat row-major buffers and the padded length.
    fn pad_text(&self, samples: &[Sample]) -> Result<(Vec<u32>, Vec<u32>, usize)> {
        let max_len = samples.iter().map(|s| s.input_ids.len()).max().unwrap_or(0);
        if max_len == 0 {
            return Err(VoiceTuneError::ProcessingError(
                "Every sample in the batch has an empty token sequence".to_string(),
            ));
        }

        let mut ids = Vec::with_capacity(samples.len() * max_len);
        let mut mask = Vec::with_capacity(samples.len() * max_len);
        for sample in samples {
            if sample.input_ids.len() != sample.attention_mask.len() {
                return Err(VoiceTuneError::ProcessingError(format!(
                    "input_ids ({}) and attention_mask ({}) lengths differ for '{}'",
                    sample.input_ids.len(),
                    sample.attention_mask.len(),
                    sample.text
                )));
            }
            let padding = max_len - sample.input_ids.len();
            ids.extend_from_slice(&sample.input_ids);
            ids.extend(std::iter::repeat_n(self.pad_token_id, padding));
            mask.extend_from_slice(&sample.attention_mask);
            mask.extend(std::iter::repeat_n(0, padding));
        }

        Ok((ids, mask, max_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_mel() -> MelConfig {
        MelConfig {
            n_fft: 256,
            win_length: 256,
            hop_length: 64,
            n_mels: 20,
            target_frames: 12,
            ..MelConfig::default()
        }
    }

    fn sample(ids: &[u32], n_samples: usize) -> Sample {
        Sample {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: (0..n_samples).map(|i| (i as f32 * 0.3).sin()).collect(),
            text: String::new(),
        }
    }

    #[test]
    fn test_collate_shapes_and_padding() {
        let collator = DataCollator::new(9, tiny_mel(), &Device::Cpu).unwrap();
        let batch = collator
            .collate(&[sample(&[4, 5, 6], 100), sample(&[7], 5000)])
            .unwrap();

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.input_ids.dims(), &[2, 3]);
        assert_eq!(batch.attention_mask.dims(), &[2, 3]);
        assert_eq!(batch.labels.dims(), &[2, 12, 20]);

        let ids = batch.input_ids.to_vec2::<u32>().unwrap();
        assert_eq!(ids, vec![vec![4, 5, 6], vec![7, 9, 9]]);
        let mask = batch.attention_mask.to_vec2::<u32>().unwrap();
        assert_eq!(mask, vec![vec![1, 1, 1], vec![1, 0, 0]]);
    }

    #[test]
    fn test_labels_within_db_range() {
        let collator = DataCollator::new(0, tiny_mel(), &Device::Cpu).unwrap();
        let batch = collator.collate(&[sample(&[1, 2], 700)]).unwrap();
        let values = batch.labels.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (-80.0 - 1e-3..=1e-3).contains(&v)));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let collator = DataCollator::new(0, tiny_mel(), &Device::Cpu).unwrap();
        assert!(collator.collate(&[]).is_err());
    }

    #[test]
    fn test_mismatched_mask_rejected() {
        let collator = DataCollator::new(0, tiny_mel(), &Device::Cpu).unwrap();
        let mut bad = sample(&[1, 2], 100);
        bad.attention_mask.pop();
        assert!(collator.collate(&[bad]).is_err());
    }
}
