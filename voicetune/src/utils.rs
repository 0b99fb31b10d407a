use crate::{Result, VoiceTuneError};
use candle_core::Device;
use hf_hub::api::sync::Api;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Pick a training device: CUDA `cuda_device` if requested and available,
/// then Metal, then CPU.
pub fn get_device(cuda_device: Option<usize>) -> Result<Device> {
    if let Some(ordinal) = cuda_device {
        match Device::new_cuda(ordinal) {
            Ok(device) => {
                info!("Training on CUDA:{}", ordinal);
                return Ok(device);
            }
            Err(e) => debug!("CUDA:{} unavailable ({})", ordinal, e),
        }
    }
    if let Ok(device) = Device::new_metal(0) {
        info!("Training on Metal");
        return Ok(device);
    }
    info!("No GPU found, training on CPU");
    Ok(Device::Cpu)
}

/// Resolve `filename` from a model source.
///
/// Accepts:
/// - a path to the file itself
/// - a local directory containing `filename`
/// - a Hugging Face Hub repo id (downloaded into the HF cache)
pub fn resolve_model_file(source: &str, filename: &str) -> Result<PathBuf> {
    let path = Path::new(source);

    if path.is_file() {
        debug!("{} resolved as file: {:?}", filename, path);
        return Ok(path.to_path_buf());
    }

    if path.is_dir() {
        let candidate = path.join(filename);
        if candidate.exists() {
            debug!("{} resolved in local dir: {:?}", filename, candidate);
            return Ok(candidate);
        }
        return Err(VoiceTuneError::InitializationError(format!(
            "{} not found in {}",
            filename,
            path.display()
        )));
    }

    info!("Fetching {} from HuggingFace repo {}...", filename, source);
    let api = Api::new()
        .map_err(|e| VoiceTuneError::DownloadError(format!("Failed to create HF API: {}", e)))?;
    api.model(source.to_string()).get(filename).map_err(|e| {
        VoiceTuneError::DownloadError(format!(
            "Failed to download {} from {}: {}",
            filename, source, e
        ))
    })
}

/// Initialize tracing output.
///
/// Logs go to stderr; when `log_dir` is given they are written to a
/// timestamped file in that directory instead. Uses `RUST_LOG` if set,
/// otherwise `info`.
///
/// Returns the log file path when file logging is enabled.
pub fn init_logging(log_dir: Option<&Path>, name: &str) -> Result<Option<PathBuf>> {
    use std::time::{SystemTime, UNIX_EPOCH};
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| VoiceTuneError::InitializationError(e.to_string()))?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let log_path = log_dir.join(format!("{}_{}.log", name, timestamp));
    let log_file = File::create(&log_path)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(log_file).with_ansi(false))
        .try_init()
        .map_err(|e| VoiceTuneError::InitializationError(e.to_string()))?;

    println!("📝 Log: {}", log_path.display());

    Ok(Some(log_path))
}
