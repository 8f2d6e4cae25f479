use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Checkpoint optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CkptOptLevel {
    /// No checkpointing path runs.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    /// Checkpoint only handles modified since the last checkpoint,
    /// synchronously.
    #[serde(rename = "modified-set")]
    ModifiedSet,
    /// Overlap checkpoint copies with subsequent operations on a dedicated
    /// stream, bounded by per-handle deadlines.
    #[serde(rename = "overlap")]
    Overlap,
}

impl CkptOptLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        Some(match level {
            0 => CkptOptLevel::Disabled,
            1 => CkptOptLevel::ModifiedSet,
            2 => CkptOptLevel::Overlap,
            _ => return None,
        })
    }
}

/// Migration optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrOptLevel {
    /// Only the full-snapshot fallback paths (allcopy / allreload).
    #[default]
    #[serde(rename = "disabled")]
    Disabled,
    /// Pre-copy / delta-copy / on-demand reload.
    #[serde(rename = "precopy")]
    Precopy,
}

impl MigrOptLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        Some(match level {
            0 => MigrOptLevel::Disabled,
            1 => MigrOptLevel::Precopy,
            _ => return None,
        })
    }
}

/// Top-level runtime configuration, loaded from vgpu.toml with environment
/// overrides applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory for per-client trace dumps; None disables tracing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_dir: Option<PathBuf>,

    #[serde(default)]
    pub ckpt_opt_level: CkptOptLevel,

    #[serde(default)]
    pub migr_opt_level: MigrOptLevel,

    /// Kernel parameter-layout cache file. Loaded at client init when the
    /// file exists; appended to at teardown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_meta_path: Option<PathBuf>,

    /// Non-empty triggers restore from this checkpoint directory on startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<PathBuf>,

    /// Prefilled vertex capacity of the dependency DAG.
    #[serde(default = "default_dag_prefill")]
    pub dag_prefill_slots: usize,

    /// Retained checkpoint versions per handle before LRU eviction.
    #[serde(default = "default_bag_high_water")]
    pub ckpt_bag_high_water: usize,

    /// Mask vendor failures of global-symbol lookup to success, matching the
    /// behavior guest frameworks depend on.
    #[serde(default = "default_true")]
    pub tolerate_missing_global: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trace_dir: None,
            ckpt_opt_level: CkptOptLevel::default(),
            migr_opt_level: MigrOptLevel::default(),
            kernel_meta_path: None,
            checkpoint_path: None,
            dag_prefill_slots: default_dag_prefill(),
            ckpt_bag_high_water: default_bag_high_water(),
            tolerate_missing_global: default_true(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    /// Environment overrides apply in both cases.
    pub fn load_or_default(path: &str) -> Self {
        let mut config = Self::load(path).unwrap_or_default();
        config.apply_env();
        config
    }

    /// Build a configuration purely from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Recognized keys: VGPU_TRACE_DIR, VGPU_CKPT_OPT_LEVEL (0|1|2),
    /// VGPU_MIGR_OPT_LEVEL (0|1), VGPU_KERNEL_META_PATH,
    /// VGPU_CHECKPOINT_PATH (empty means unset).
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("VGPU_TRACE_DIR") {
            if !dir.is_empty() {
                self.trace_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(level) = std::env::var("VGPU_CKPT_OPT_LEVEL") {
            match level.parse::<u8>().ok().and_then(CkptOptLevel::from_level) {
                Some(l) => self.ckpt_opt_level = l,
                None => tracing::warn!(level = %level, "unrecognized VGPU_CKPT_OPT_LEVEL, keeping {:?}", self.ckpt_opt_level),
            }
        }
        if let Ok(level) = std::env::var("VGPU_MIGR_OPT_LEVEL") {
            match level.parse::<u8>().ok().and_then(MigrOptLevel::from_level) {
                Some(l) => self.migr_opt_level = l,
                None => tracing::warn!(level = %level, "unrecognized VGPU_MIGR_OPT_LEVEL, keeping {:?}", self.migr_opt_level),
            }
        }
        if let Ok(path) = std::env::var("VGPU_KERNEL_META_PATH") {
            if !path.is_empty() {
                self.kernel_meta_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("VGPU_CHECKPOINT_PATH") {
            if !path.is_empty() {
                self.checkpoint_path = Some(PathBuf::from(path));
            }
        }
    }
}

fn default_dag_prefill() -> usize {
    1 << 20
}

fn default_bag_high_water() -> usize {
    8
}

fn default_true() -> bool {
    true
}
