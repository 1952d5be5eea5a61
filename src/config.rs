//! Layered configuration using Figment.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/strip-blur.toml` (or the file passed with `--config`); optional
//! 3. Environment variables prefixed with `STRIP_BLUR_`, sections split on `__`
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Example
//! ```no_run
//! use strip_blur::config::BlurConfig;
//!
//! let config = BlurConfig::load()?;
//! config.validate()?;
//! println!("{} strips via {}", config.pipeline.strips, config.pipeline.transport);
//! # Ok::<(), strip_blur::error::StripError>(())
//! ```

use crate::error::{StripError, StripResult};
use crate::filter::{FilterKind, FilterSpec, DEFAULT_SIGMA};
use crate::logging::{parse_log_level, OutputFormat};
use crate::shared_buffer::LayoutKind;
use crate::transport::{TransportKind, TransportOptions, WorkerCommand};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/strip-blur.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "STRIP_BLUR_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    /// Logging settings
    pub application: ApplicationConfig,
    /// Partitioning and filtering
    pub pipeline: PipelineConfig,
    /// Worker process settings
    pub workers: WorkersConfig,
    /// Intermediate strip output
    pub output: OutputConfig,
    /// Shared-memory transport settings
    pub shared: SharedConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// What the pipeline does to an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of vertical strips
    pub strips: usize,
    /// How results travel back from workers
    pub transport: TransportKind,
    /// Filter applied by workers
    pub filter: FilterKind,
    /// Gaussian sigma
    pub sigma: f32,
    /// Pass pipe/pool results through a shared buffer before reassembly
    pub round_trip_shared: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strips: 2,
            transport: TransportKind::Pipe,
            filter: FilterKind::Gaussian,
            sigma: DEFAULT_SIGMA,
            round_trip_shared: false,
        }
    }
}

/// Worker process configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Worker executable; the running binary when unset
    pub program: Option<PathBuf>,
    /// Pool lane cap (0 = one lane per strip)
    pub pool_size: usize,
    /// Per-operation receive timeout in milliseconds
    pub receive_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            program: None,
            pool_size: 0,
            receive_timeout_ms: 30_000,
        }
    }
}

/// Intermediate strip output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Write each filtered strip to its own file
    pub save_strips: bool,
    /// File name prefix; files are `{prefix}_{n}.{extension}` with 1-based `n`
    pub strip_prefix: String,
    /// File extension, which also selects the encoder
    pub strip_extension: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_strips: false,
            strip_prefix: "blurred_part".to_string(),
            strip_extension: "jpg".to_string(),
        }
    }
}

/// Shared-memory transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    /// Directory for backing files; `/dev/shm` when present, else the temp dir
    pub dir: Option<PathBuf>,
    /// Slot layout
    pub layout: LayoutKind,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            dir: None,
            layout: LayoutKind::Packed,
        }
    }
}

impl BlurConfig {
    /// Load from `config/strip-blur.toml` and the environment.
    ///
    /// Environment variables override the file, e.g.
    /// `STRIP_BLUR_PIPELINE__STRIPS=4` or `STRIP_BLUR_WORKERS__POOL_SIZE=2`.
    pub fn load() -> StripResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StripResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack behind [`BlurConfig::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(BlurConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading and applying overrides.
    pub fn validate(&self) -> StripResult<()> {
        parse_log_level(&self.application.log_level).map_err(StripError::Configuration)?;

        if self.pipeline.strips == 0 {
            return Err(StripError::Configuration(
                "pipeline.strips must be at least 1".to_string(),
            ));
        }
        if self.pipeline.filter == FilterKind::Gaussian
            && !(self.pipeline.sigma.is_finite() && self.pipeline.sigma > 0.0)
        {
            return Err(StripError::Configuration(format!(
                "Invalid pipeline.sigma {}. Must be a positive number",
                self.pipeline.sigma
            )));
        }
        if self.workers.receive_timeout_ms == 0 {
            return Err(StripError::Configuration(
                "workers.receive_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.output.strip_prefix.is_empty() {
            return Err(StripError::Configuration(
                "output.strip_prefix must not be empty".to_string(),
            ));
        }
        if image::ImageFormat::from_extension(&self.output.strip_extension).is_none() {
            return Err(StripError::Configuration(format!(
                "Unsupported output.strip_extension '{}'",
                self.output.strip_extension
            )));
        }
        Ok(())
    }

    /// Filter workers should apply.
    pub fn filter_spec(&self) -> FilterSpec {
        FilterSpec {
            kind: self.pipeline.filter,
            sigma: self.pipeline.sigma,
        }
    }

    /// Receive timeout as a [`Duration`].
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.receive_timeout_ms)
    }

    /// Options handed to every transport.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            receive_timeout: self.receive_timeout(),
            pool_size: self.workers.pool_size,
            layout: self.shared.layout,
            shared_dir: self.shared.dir.clone(),
        }
    }

    /// Command that starts one worker process.
    pub fn worker_command(&self) -> StripResult<WorkerCommand> {
        let filter = self.filter_spec();
        let level = self.application.log_level.as_str();
        match &self.workers.program {
            Some(program) => Ok(WorkerCommand::for_filter(program, &filter, level)),
            None => WorkerCommand::current_exe(&filter, level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = BlurConfig::default();
        assert_eq!(config.pipeline.strips, 2);
        assert_eq!(config.pipeline.transport, TransportKind::Pipe);
        assert_eq!(config.workers.receive_timeout_ms, 30_000);
        assert_eq!(config.output.strip_prefix, "blurred_part");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let config = BlurConfig::load_from("does-not-exist.toml").unwrap();
            assert_eq!(config, BlurConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "blur.toml",
                r#"
                [pipeline]
                strips = 4
                transport = "pool"

                [workers]
                pool_size = 3

                [shared]
                layout = "uniform"
                "#,
            )?;
            jail.set_env("STRIP_BLUR_PIPELINE__STRIPS", "6");
            jail.set_env("STRIP_BLUR_APPLICATION__LOG_LEVEL", "debug");

            let config = BlurConfig::load_from("blur.toml").unwrap();
            assert_eq!(config.pipeline.strips, 6);
            assert_eq!(config.pipeline.transport, TransportKind::Pool);
            assert_eq!(config.workers.pool_size, 3);
            assert_eq!(config.shared.layout, LayoutKind::Uniform);
            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.pipeline.sigma, DEFAULT_SIGMA);
            Ok(())
        });
    }

    #[test]
    fn unknown_transport_is_a_load_error() {
        Jail::expect_with(|jail| {
            jail.create_file("blur.toml", "[pipeline]\ntransport = \"carrier-pigeon\"\n")?;
            assert!(matches!(
                BlurConfig::load_from("blur.toml"),
                Err(StripError::Config(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values() {
        let mut config = BlurConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = BlurConfig::default();
        config.pipeline.strips = 0;
        assert!(config.validate().is_err());

        let mut config = BlurConfig::default();
        config.pipeline.sigma = -1.0;
        assert!(config.validate().is_err());
        config.pipeline.filter = FilterKind::Identity;
        assert!(config.validate().is_ok());

        let mut config = BlurConfig::default();
        config.output.strip_extension = "xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(StripError::Configuration(_))
        ));
    }

    #[test]
    fn transport_options_follow_config() {
        let mut config = BlurConfig::default();
        config.workers.pool_size = 2;
        config.workers.receive_timeout_ms = 1500;
        config.shared.dir = Some(PathBuf::from("/tmp/strips"));

        let options = config.transport_options();
        assert_eq!(options.pool_size, 2);
        assert_eq!(options.receive_timeout, Duration::from_millis(1500));
        assert_eq!(options.shared_dir.as_deref(), Some(Path::new("/tmp/strips")));
    }

    #[test]
    fn configured_worker_program_is_used() {
        let mut config = BlurConfig::default();
        config.workers.program = Some(PathBuf::from("/opt/blur-worker"));
        let command = config.worker_command().unwrap();
        assert_eq!(command.program(), Path::new("/opt/blur-worker"));
    }
}
