//! LOD session configuration
//!
//! Loaded from TOML or built in code. Every field has a default so a config
//! file only needs to name what it changes.

use crate::error::{LodError, LodResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Deepest treelet we will allocate node slots for
pub const MAX_TREELET_DEPTH: u32 = 16;

/// Configuration for a LOD streaming session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    /// Slot capacity of the dynamic tree
    pub dynamic_node_count: usize,
    /// Slot capacity of the mesh block cache (0 = full mesh resident, no streaming)
    pub mesh_block_count: usize,
    /// Additional depth of the per-block treelets (0 = no treelets)
    pub treelet_depth: u32,
    /// Block a node from being merged right after a split (and vice versa)
    pub hysteresis: bool,
    /// Seed the dynamic tree depth-first instead of breadth-first
    pub depth_first_seed: bool,
    /// Per-frame merge/split budget as a fraction of `dynamic_node_count`
    pub modify_list_fraction: f32,
    /// Largest number of blocks sent in one fetch request
    pub max_blocks_per_request: usize,
    /// Treelet cell slot size relative to the largest leaf's cell count
    pub treelet_cell_overallocation: f32,
    /// Camera movement below this does not start a new hysteresis epoch
    pub view_change_epsilon: f32,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            dynamic_node_count: 2048,
            mesh_block_count: 256,
            treelet_depth: 4,
            hysteresis: true,
            depth_first_seed: false,
            modify_list_fraction: 0.005,
            max_blocks_per_request: 1000,
            treelet_cell_overallocation: 2.0,
            view_change_epsilon: 1e-4,
        }
    }
}

impl LodConfig {
    /// Parse a config from TOML text, then validate it
    pub fn from_toml_str(text: &str) -> LodResult<Self> {
        let config: LodConfig = toml::from_str(text).map_err(|e| LodError::ConfigLoad {
            path: "<inline>".into(),
            error: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> LodResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| LodError::ConfigLoad {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        let config: LodConfig = toml::from_str(&text).map_err(|e| LodError::ConfigLoad {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        config.validate()?;
        log::info!("[LodConfig] Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> LodResult<()> {
        // seeding stops once count - 2 slots are used
        if self.dynamic_node_count < 4 {
            return Err(LodError::invalid_config(
                "dynamic_node_count",
                self.dynamic_node_count,
                "at least 4 slots are needed to expand the root",
            ));
        }
        if !(self.modify_list_fraction > 0.0) || !self.modify_list_fraction.is_finite() {
            return Err(LodError::invalid_config(
                "modify_list_fraction",
                self.modify_list_fraction,
                "must be a positive finite number",
            ));
        }
        if self.max_blocks_per_request == 0 {
            return Err(LodError::invalid_config(
                "max_blocks_per_request",
                self.max_blocks_per_request,
                "must be non-zero",
            ));
        }
        if self.treelet_depth > MAX_TREELET_DEPTH {
            return Err(LodError::invalid_config(
                "treelet_depth",
                self.treelet_depth,
                "treelet node buffers grow as 2^depth",
            ));
        }
        if !(self.treelet_cell_overallocation >= 1.0) {
            return Err(LodError::invalid_config(
                "treelet_cell_overallocation",
                self.treelet_cell_overallocation,
                "must be at least 1.0",
            ));
        }
        if !(self.view_change_epsilon >= 0.0) {
            return Err(LodError::invalid_config(
                "view_change_epsilon",
                self.view_change_epsilon,
                "must be non-negative",
            ));
        }
        Ok(())
    }

    /// Number of merge/split changes considered per frame
    pub fn modify_list_length(&self) -> usize {
        ((self.dynamic_node_count as f32 * self.modify_list_fraction).ceil() as usize).max(1)
    }

    pub fn uses_mesh_cache(&self) -> bool {
        self.mesh_block_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        assert!(LodConfig::default().validate().is_ok());
    }

    #[test]
    fn test_modify_list_length_rounds_up() {
        let config = LodConfig {
            dynamic_node_count: 4,
            ..Default::default()
        };
        assert_eq!(config.modify_list_length(), 1);

        let config = LodConfig {
            dynamic_node_count: 10_000,
            ..Default::default()
        };
        assert_eq!(config.modify_list_length(), 50);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LodConfig::from_toml_str("treelet_depth = 2\nhysteresis = false\n")
            .expect("Failed to parse config");
        assert_eq!(config.treelet_depth, 2);
        assert!(!config.hysteresis);
        assert_eq!(config.dynamic_node_count, 2048);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = LodConfig::from_toml_str("dynamic_node_count = 2").unwrap_err();
        assert!(matches!(err, LodError::InvalidConfig { ref field, .. } if field == "dynamic_node_count"));

        let err = LodConfig::from_toml_str("max_blocks_per_request = 0").unwrap_err();
        assert!(matches!(err, LodError::InvalidConfig { .. }));

        let err = LodConfig::from_toml_str("modify_list_fraction = -1.0").unwrap_err();
        assert!(matches!(err, LodError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        writeln!(file, "mesh_block_count = 0").expect("Failed to write config");
        writeln!(file, "dynamic_node_count = 64").expect("Failed to write config");

        let config = LodConfig::load(file.path()).expect("Failed to load config");
        assert_eq!(config.dynamic_node_count, 64);
        assert!(!config.uses_mesh_cache());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = LodConfig::load("/nonexistent/lod.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/lod.toml"));
    }
}
