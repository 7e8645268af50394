/*
 * @file config.rs
 * @brief Engine-level configuration for the aggregation pipeline
 */

use crate::error::{DocPipeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs the aggregation core itself has authority over. Network, storage,
/// and auth settings belong to the host application and are not modeled
/// here — they live outside the scope of this engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rejects pipelines with more stages than this, before execution.
    pub max_pipeline_stages: usize,
    /// Caps the in-memory foreign set `$lookup`/`$graphLookup` may hold.
    pub max_lookup_fanout: usize,
    /// Upper bound on `$graphLookup` BFS depth, independent of `maxDepth`.
    pub max_graph_lookup_depth: u32,
    /// Upper bound accepted for `$sample` when the caller doesn't cap it.
    pub default_sample_size_cap: usize,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pipeline_stages: 200,
            max_lookup_fanout: 1_000_000,
            max_graph_lookup_depth: 1000,
            default_sample_size_cap: 1_000_000,
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl EngineConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path).await?;

        let config: EngineConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| DocPipeError::Config(e.to_string()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| DocPipeError::Config(e.to_string()))?,
            _ => toml::from_str(&content).map_err(|e| DocPipeError::Config(e.to_string()))?,
        };

        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => {
                serde_json::to_string_pretty(self).map_err(|e| DocPipeError::Config(e.to_string()))?
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).map_err(|e| DocPipeError::Config(e.to_string()))?
            }
            _ => toml::to_string_pretty(self).map_err(|e| DocPipeError::Config(e.to_string()))?,
        };

        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.max_pipeline_stages > 0);
        assert!(cfg.max_lookup_fanout > 0);
    }
}
