use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::error::InpaintError;
use crate::media::masks::MaskOptions;
use crate::model::ModelVariant;
use crate::sampler::ReferenceLimit;
use crate::schedule::{ScheduleParams, DEFAULT_NEIGHBOR_STRIDE, DEFAULT_REFERENCE_STEP};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VIDFILL_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub schedule: ScheduleConfig,
    pub mask: MaskOptions,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Relative checkpoint paths are looked up here when not found as given.
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
    pub model: ModelVariant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScheduleConfig {
    pub step: usize,
    /// `-1` samples references across the whole video.
    pub num_ref: i64,
    pub neighbor_stride: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub fps: f64,
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            step: DEFAULT_REFERENCE_STEP,
            num_ref: -1,
            neighbor_stride: DEFAULT_NEIGHBOR_STRIDE,
        }
    }
}

impl ScheduleConfig {
    pub fn to_params(&self) -> Result<ScheduleParams, InpaintError> {
        let params = ScheduleParams {
            neighbor_stride: self.neighbor_stride,
            reference_step: self.step,
            reference_limit: ReferenceLimit::from_signed(self.num_ref)?,
        };
        params.validate()?;
        Ok(params)
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            fps: 24.0,
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `VIDFILL_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` and writes a default `config.toml` if none exists yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.inference.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.inference.model, ModelVariant::E2fgvi);
        assert_eq!(cfg.schedule.step, 10);
        assert_eq!(cfg.schedule.num_ref, -1);
        assert_eq!(cfg.schedule.neighbor_stride, 5);
        assert_eq!(cfg.mask.dilation_kernel, 10);
        assert_eq!(cfg.mask.dilation_iterations, 8);
        assert_eq!(cfg.output.fps, 24.0);
        assert_eq!(cfg.output.codec, "libx264");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let raw = "[inference]\nbackend = \"tensorrt\"\nmodel = \"e2fgvi_hq\"\n\n[schedule]\nnum_ref = 4\n";
        let cfg: AppConfig = toml::from_str(raw).expect("deserialize partial config");
        assert_eq!(cfg.inference.backend, InferenceBackend::Tensorrt);
        assert_eq!(cfg.inference.model, ModelVariant::E2fgviHq);
        assert_eq!(cfg.schedule.num_ref, 4);
        assert_eq!(cfg.schedule.step, 10);
        assert_eq!(cfg.output, OutputConfig::default());
    }

    #[test]
    fn schedule_config_to_params() {
        let params = ScheduleConfig::default().to_params().unwrap();
        assert_eq!(params, ScheduleParams::default());

        let bounded = ScheduleConfig {
            num_ref: 3,
            ..ScheduleConfig::default()
        };
        assert_eq!(
            bounded.to_params().unwrap().reference_limit,
            ReferenceLimit::AtMost(3)
        );

        let invalid = ScheduleConfig {
            num_ref: -5,
            ..ScheduleConfig::default()
        };
        assert!(matches!(
            invalid.to_params(),
            Err(InpaintError::InvalidConfig(_))
        ));

        let zero_stride = ScheduleConfig {
            neighbor_stride: 0,
            ..ScheduleConfig::default()
        };
        assert!(zero_stride.to_params().is_err());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&dir.path().join("config.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_empty_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[schedule\nstep = ").unwrap();
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");
        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&data.join("config.toml")).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[output]\nfps = 30.0\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_both_kinds() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
