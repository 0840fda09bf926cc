use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::net::bitbuf::CodecMode;

/// Hard ceiling on instanced sub-worlds, root world included.
pub const MAX_INSTANCED_WORLDS: u16 = 2048;

/// Protocol tuning knobs. The per-generation constants (high-resolution
/// cap, priority caps) are configuration, not separate code paths: the
/// current client generation runs the defaults, the legacy generation the
/// `legacy` preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Entities one observer may track per world. Must fit the one-byte
    /// count field.
    pub high_res_cap: usize,
    /// Slots reserved for the low-priority bucket.
    pub low_priority_cap: usize,
    /// Soft cap for the normal bucket; overflow spills into the low
    /// bucket.
    pub normal_priority_soft_cap: usize,
    /// Default observer render distance, in tiles.
    pub render_distance: u16,
    /// Discovery scan radius around the observer, in tiles.
    pub zone_search_radius: u16,
    /// Worker threads for the parallel phases. 0 runs every unit inline
    /// on the coordinating thread.
    pub worker_threads: usize,
    /// Select the raw-pointer bit codec fast path. The checked path stays
    /// the default and the reference for tests.
    pub unchecked_codec: bool,
    /// Instanced sub-world ids accepted, `<= MAX_INSTANCED_WORLDS`.
    pub max_worlds: u16,
    /// Per-observer output buffer ceiling, in bytes.
    pub packet_limit: usize,
    /// Retired avatar records kept for reuse before LRU eviction.
    pub recycle_cap: usize,
    /// Ticks slower than this are written to the lag log.
    pub lag_threshold_millis: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            high_res_cap: 149,
            low_priority_cap: 10,
            normal_priority_soft_cap: 139,
            render_distance: 15,
            zone_search_radius: 15,
            worker_threads: 0,
            unchecked_codec: false,
            max_worlds: MAX_INSTANCED_WORLDS,
            packet_limit: 40_000,
            recycle_cap: 4096,
            lag_threshold_millis: 500,
        }
    }
}

impl ProtocolConfig {
    /// The earlier protocol generation tracked up to 250 entities per
    /// observer.
    pub fn legacy() -> Self {
        Self {
            high_res_cap: 250,
            low_priority_cap: 15,
            normal_priority_soft_cap: 235,
            ..Self::default()
        }
    }

    pub fn codec_mode(&self) -> CodecMode {
        if self.unchecked_codec {
            CodecMode::Unchecked
        } else {
            CodecMode::Checked
        }
    }

    /// Load from a YAML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| format!("config read {} failed: {}", path.display(), err))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .map_err(|err| format!("config parse {} failed: {}", path.display(), err))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("AVATARSYNC_WORKERS") {
            match value.trim().parse::<usize>() {
                Ok(parsed) => self.worker_threads = parsed,
                Err(_) => eprintln!(
                    "avatarsync: invalid AVATARSYNC_WORKERS '{}', keeping {}",
                    value, self.worker_threads
                ),
            }
        }
        if let Some(value) = get("AVATARSYNC_PACKET_LIMIT") {
            match value.trim().parse::<usize>() {
                Ok(parsed) => self.packet_limit = parsed,
                Err(_) => eprintln!(
                    "avatarsync: invalid AVATARSYNC_PACKET_LIMIT '{}', keeping {}",
                    value, self.packet_limit
                ),
            }
        }
        if let Some(value) = get("AVATARSYNC_UNCHECKED_CODEC") {
            match value.trim() {
                "1" | "true" | "yes" => self.unchecked_codec = true,
                "0" | "false" | "no" => self.unchecked_codec = false,
                other => eprintln!(
                    "avatarsync: invalid AVATARSYNC_UNCHECKED_CODEC '{}', keeping {}",
                    other, self.unchecked_codec
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.high_res_cap == 0 || self.high_res_cap > usize::from(u8::MAX) {
            return Err(format!(
                "high_res_cap {} must fit the one-byte count field",
                self.high_res_cap
            ));
        }
        if self.low_priority_cap + self.normal_priority_soft_cap > self.high_res_cap {
            return Err(format!(
                "priority caps {}+{} exceed high_res_cap {}",
                self.low_priority_cap, self.normal_priority_soft_cap, self.high_res_cap
            ));
        }
        if self.max_worlds == 0 || self.max_worlds > MAX_INSTANCED_WORLDS {
            return Err(format!(
                "max_worlds {} outside 1..={}",
                self.max_worlds, MAX_INSTANCED_WORLDS
            ));
        }
        if self.render_distance == 0 {
            return Err("render_distance must be at least 1".to_string());
        }
        if self.packet_limit < 2 {
            return Err(format!("packet_limit {} too small", self.packet_limit));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ProtocolConfig::default().validate().expect("defaults");
        ProtocolConfig::legacy().validate().expect("legacy");
    }

    #[test]
    fn legacy_generation_raises_the_cap() {
        let legacy = ProtocolConfig::legacy();
        assert_eq!(legacy.high_res_cap, 250);
        assert!(legacy.low_priority_cap + legacy.normal_priority_soft_cap <= 250);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let config: ProtocolConfig = serde_yaml::from_str(
            "high_res_cap: 99\nlow_priority_cap: 4\nnormal_priority_soft_cap: 95\nworker_threads: 3\n",
        )
        .expect("parse");
        assert_eq!(config.high_res_cap, 99);
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.render_distance, 15);
        config.validate().expect("valid");
    }

    #[test]
    fn cap_invariants_are_enforced() {
        let mut config = ProtocolConfig::default();
        config.low_priority_cap = 100;
        config.normal_priority_soft_cap = 100;
        assert!(config.validate().is_err());

        let mut config = ProtocolConfig::default();
        config.high_res_cap = 300;
        assert!(config.validate().is_err());

        let mut config = ProtocolConfig::default();
        config.max_worlds = MAX_INSTANCED_WORLDS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let mut config = ProtocolConfig::default();
        config.apply_overrides(|name| match name {
            "AVATARSYNC_WORKERS" => Some("8".to_string()),
            "AVATARSYNC_UNCHECKED_CODEC" => Some("true".to_string()),
            "AVATARSYNC_PACKET_LIMIT" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.worker_threads, 8);
        assert!(config.unchecked_codec);
        assert_eq!(config.packet_limit, 40_000);
    }
}
