use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregator::ContinuityPolicy;
use crate::writer;

const DEFAULT_POLL_SECONDS: u64 = 10;
const DEFAULT_AUTOSAVE_TICKS: u64 = 60;
const CONFIG_SCHEMA_VERSION: u32 = 2;
const APP_DIR_NAME: &str = "appusage-agent";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub schema_version: u32,
    /// Where snapshots go; the executable's own directory when unset.
    pub output_dir: Option<String>,
    /// Steam install directory; looked up from the system when unset.
    pub steam_path: Option<String>,
    pub collect_accounts: bool,
    pub continuity: ContinuityPolicy,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub autosave_every_ticks: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            output_dir: None,
            steam_path: None,
            collect_accounts: true,
            continuity: ContinuityPolicy::Preserve,
        }
    }
}

impl AgentConfig {
    pub fn load_or_init() -> Result<Self> {
        let cfg_path = config_path();
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(&cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: AgentConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save()?;
            }
            Ok(parsed)
        } else {
            let cfg = AgentConfig::default();
            cfg.save()?;
            Ok(cfg)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn effective_output_dir(&self) -> PathBuf {
        self.output_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(writer::install_dir)
    }

    pub fn effective_steam_path(&self) -> Option<PathBuf> {
        let from_env = env::var("APPUSAGE_STEAM_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        from_env
            .or_else(|| self.steam_path.clone())
            .map(PathBuf::from)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }
        for item in [&mut self.output_dir, &mut self.steam_path] {
            if normalize_optional_string(item) {
                changed = true;
            }
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        poll_interval: Duration::from_secs(env_u64("APPUSAGE_POLL_SECONDS", DEFAULT_POLL_SECONDS)),
        autosave_every_ticks: env_u64("APPUSAGE_AUTOSAVE_TICKS", DEFAULT_AUTOSAVE_TICKS),
    }
}

pub fn agent_home() -> PathBuf {
    if let Ok(custom) = env::var("APPUSAGE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(".").join(format!(".{APP_DIR_NAME}")))
}

pub fn config_path() -> PathBuf {
    agent_home().join("config.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    if let Some(item) = value.as_mut() {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
            return true;
        }
        if *item != trimmed {
            *item = trimmed;
            return true;
        }
    }
    false
}
