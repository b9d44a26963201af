use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "loopgraph.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub walk: WalkSection,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_start_beat")]
    pub start_beat: usize,
    #[serde(default)]
    pub clusters: usize,
    #[serde(default = "default_min_clusters")]
    pub min_clusters: usize,
    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,
    #[serde(default)]
    pub truncate_at_fade: bool,
    #[serde(default = "default_trim_db")]
    pub trim_db: f32,
}

#[derive(Debug, Deserialize)]
pub struct WalkSection {
    #[serde(default = "default_walk_length")]
    pub length: usize,
    pub seed: Option<u64>,
    pub max_beats_between_jumps: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            start_beat: default_start_beat(),
            clusters: 0,
            min_clusters: default_min_clusters(),
            max_clusters: default_max_clusters(),
            truncate_at_fade: false,
            trim_db: default_trim_db(),
        }
    }
}

impl Default for WalkSection {
    fn default() -> Self {
        Self {
            length: default_walk_length(),
            seed: None,
            max_beats_between_jumps: None,
        }
    }
}

fn default_start_beat() -> usize { 1 }
fn default_min_clusters() -> usize { 4 }
fn default_max_clusters() -> usize { 50 }
fn default_trim_db() -> f32 { 60.0 }
fn default_walk_length() -> usize { 1 << 20 }

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(err) => {
            log::warn!("Invalid config {}: {}", path.display(), err);
            None
        }
    }
}

/// Explicit path, else `loopgraph.toml` in `cwd`, else the user config
/// locations.
pub fn find_config_path(explicit: Option<PathBuf>, cwd: &Path) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    let local = cwd.join(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("loopgraph").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("loopgraph").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}
