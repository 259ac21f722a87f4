use crate::context::InterruptedTurnPolicy;
use crate::defaults;
use crate::error::{ParleyError, Result};
use crate::interruption::{InterruptionPolicy, SystemClock};
use crate::pipeline::orchestrator::PipelineConfig;
use crate::pipeline::task::TaskParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
#[cfg(feature = "cli")]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineSettings,
    pub interruption: InterruptionSettings,
    pub context: ContextSettings,
}

/// Pipeline execution configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub backend_timeout_ms: u64,
    pub cancel_grace_ms: u64,
    pub sample_rate: u32,
}

/// Interruption configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterruptionSettings {
    pub allow_interruptions: bool,
    pub policy: InterruptionPolicy,
    pub silence_reset_ms: u64,
    pub interrupted_turn: InterruptedTurnPolicy,
}

/// Conversation context configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextSettings {
    pub system_prompt: String,
    /// System message appended when a client connects, prompting the
    /// assistant to speak first. Empty disables the kick-off.
    pub greeting: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
            backend_timeout_ms: defaults::BACKEND_TIMEOUT_MS,
            cancel_grace_ms: defaults::CANCEL_GRACE_MS,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

impl Default for InterruptionSettings {
    fn default() -> Self {
        Self {
            allow_interruptions: true,
            policy: InterruptionPolicy::default(),
            silence_reset_ms: defaults::SILENCE_RESET_MS,
            interrupted_turn: InterruptedTurnPolicy::default(),
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            system_prompt: defaults::SYSTEM_PROMPT.to_string(),
            greeting: defaults::GREETING.to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values. A missing file is
    /// [`ParleyError::ConfigFileNotFound`].
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ParleyError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ParleyError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(ParleyError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - PARLEY_MIN_WORDS → interruption.policy (min-words threshold)
    /// - PARLEY_SYSTEM_PROMPT → context.system_prompt
    /// - PARLEY_BACKEND_TIMEOUT_MS → pipeline.backend_timeout_ms
    ///
    /// Empty or unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("PARLEY_MIN_WORDS") {
            match value.trim().parse::<usize>() {
                Ok(min_words) => self.interruption.policy = InterruptionPolicy::min_words(min_words),
                Err(_) if value.is_empty() => {}
                Err(e) => tracing::warn!(value = %value, error = %e, "ignoring PARLEY_MIN_WORDS"),
            }
        }

        if let Ok(prompt) = std::env::var("PARLEY_SYSTEM_PROMPT")
            && !prompt.is_empty()
        {
            self.context.system_prompt = prompt;
        }

        if let Ok(value) = std::env::var("PARLEY_BACKEND_TIMEOUT_MS") {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.pipeline.backend_timeout_ms = ms,
                Err(_) if value.is_empty() => {}
                Err(e) => {
                    tracing::warn!(value = %value, error = %e, "ignoring PARLEY_BACKEND_TIMEOUT_MS")
                }
            }
        }

        self
    }

    /// Rejects values that would make the pipeline unusable.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.queue_capacity == 0 {
            return Err(invalid("pipeline.queue_capacity", "must be at least 1"));
        }
        if self.pipeline.backend_timeout_ms == 0 {
            return Err(invalid("pipeline.backend_timeout_ms", "must be positive"));
        }
        if self.pipeline.sample_rate == 0 {
            return Err(invalid("pipeline.sample_rate", "must be positive"));
        }
        match self.interruption.policy {
            InterruptionPolicy::MinWords { min_words: 0 } => {
                return Err(invalid("interruption.policy.min_words", "must be at least 1"));
            }
            InterruptionPolicy::VoiceActivity { min_frames: 0, .. } => {
                return Err(invalid("interruption.policy.min_frames", "must be at least 1"));
            }
            InterruptionPolicy::VoiceActivity {
                energy_threshold, ..
            } if !(0.0..=1.0).contains(&energy_threshold) => {
                return Err(invalid(
                    "interruption.policy.energy_threshold",
                    "must be between 0.0 and 1.0",
                ));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.pipeline.queue_capacity,
        }
    }

    pub fn task_params(&self) -> TaskParams {
        TaskParams {
            allow_interruptions: self.interruption.allow_interruptions,
            strategy: Arc::new(self.interruption.policy.clone()),
            silence_reset: Duration::from_millis(self.interruption.silence_reset_ms),
            cancel_grace: Duration::from_millis(self.pipeline.cancel_grace_ms),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ParleyError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/parley/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().ok_or_else(|| {
            ParleyError::Other("could not determine config directory".to_string())
        })?;
        Ok(dir.join("parley").join("config.toml"))
    }
}

fn invalid(key: &str, message: &str) -> ParleyError {
    ParleyError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
