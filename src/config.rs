use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Engine configuration. Compiled defaults, overridden by an optional
/// `config.toml` in the data directory, overridden by `STAGEHAND_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Default model id passed to the provider when an agent does not name one.
    pub model: String,
    /// Cap on tool-calling rounds per turn.
    pub max_tool_rounds: usize,
    /// Character budget for uncompacted session history.
    pub context_char_ceiling: usize,
    /// Upper bound on a compacted session summary.
    pub summary_max_chars: usize,
    pub interactive_workers: usize,
    pub batch_workers: usize,
    /// Scheduler tick interval. Floored to 5 seconds at use sites.
    pub scheduler_tick_secs: u64,
    pub queue_max_attempts: u32,
    pub queue_backoff_base_ms: u64,
    /// How long a cancel request stays observable before it expires.
    pub cancel_flag_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            model: "gpt-4o-mini".to_string(),
            max_tool_rounds: 3,
            context_char_ceiling: 120_000,
            summary_max_chars: 4_000,
            interactive_workers: 4,
            batch_workers: 1,
            scheduler_tick_secs: 10,
            queue_max_attempts: 3,
            queue_backoff_base_ms: 2_000,
            cancel_flag_ttl_secs: 3_600,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STAGEHAND_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stagehand")
}

impl EngineConfig {
    /// Load configuration: defaults, then `<data_dir>/config.toml` when it
    /// exists, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        let path = config.data_dir.join("config.toml");
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            config = toml::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STAGEHAND_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(model) = std::env::var("STAGEHAND_MODEL") {
            self.model = model;
        }
        if let Ok(v) = std::env::var("STAGEHAND_INTERACTIVE_WORKERS")
            && let Ok(n) = v.parse()
        {
            self.interactive_workers = n;
        }
        if let Ok(v) = std::env::var("STAGEHAND_BATCH_WORKERS")
            && let Ok(n) = v.parse()
        {
            self.batch_workers = n;
        }
        if let Ok(v) = std::env::var("STAGEHAND_TICK_SECS")
            && let Ok(n) = v.parse()
        {
            self.scheduler_tick_secs = n;
        }
    }

    /// Budget for the most recent messages kept verbatim during compaction.
    pub fn recent_tail_budget(&self) -> usize {
        self.context_char_ceiling / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_tool_rounds, 3);
        assert_eq!(cfg.context_char_ceiling, 120_000);
        assert_eq!(cfg.recent_tail_budget(), 12_000);
        assert!(cfg.scheduler_tick_secs >= 5);
        assert!(cfg.queue_max_attempts >= 1);
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            model = "gpt-4o"
            max_tool_rounds = 5
            interactive_workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model, "gpt-4o");
        assert_eq!(cfg.max_tool_rounds, 5);
        assert_eq!(cfg.interactive_workers, 8);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.batch_workers, 1);
    }
}
