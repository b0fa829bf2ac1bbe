//! CLI route: single route table and run context.

use crate::cli::parse::{Commands, OutputFormat};
use crate::cli::presentation::{format_capture_json, format_capture_text};
use crate::config::{ConfigLoader, VolcapConfig};
use crate::error::ApiError;
use crate::tree::ImageCapture;
use crate::volume::{HostVolumeSource, VolumeSource};
use std::path::{Path, PathBuf};
use tracing::info;

/// Runtime context for CLI execution: loaded configuration and the source
/// volumes are opened from.
pub struct RunContext {
    config: VolcapConfig,
    source: Box<dyn VolumeSource>,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: &Path, config_path: Option<&PathBuf>) -> Result<Self, ApiError> {
        let config = match config_path {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load(workspace_root)?,
        };
        Ok(Self::with_source(config.validated()?, Box::new(HostVolumeSource)))
    }

    /// Run context over an arbitrary volume source
    pub fn with_source(config: VolcapConfig, source: Box<dyn VolumeSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &VolcapConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        match command {
            Commands::Capture {
                device,
                format,
                list,
                inline_limit,
                normalize_names,
            } => {
                let mut capture_config = self.config.capture.clone();
                if let Some(limit) = inline_limit {
                    capture_config.inline_limit = *limit;
                }
                capture_config.normalize_names |= *normalize_names;
                capture_config.validate().map_err(ApiError::ConfigError)?;

                let image = ImageCapture::new(device.as_str())
                    .with_config(capture_config)
                    .run(self.source.as_ref())?;
                info!(device = %device, objects = image.stats.objects, "Capture finished");

                match format {
                    OutputFormat::Json => format_capture_json(device, &image, *list),
                    OutputFormat::Text => Ok(format_capture_text(device, &image, *list)),
                }
            }
            Commands::Config => self.config.to_toml(),
        }
    }
}
