/*
 * Created on Wed Jan 31 2024
 *
 * This file is a part of SkyFS
 * SkyFS is a free and open-source transactional filesystem storage engine
 * written by Sayan Nandan ("the Author") with the vision to keep every byte
 * of user data and metadata in a single balanced tree without compromising
 * on durability, concurrency or performance.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Configuration: a YAML file, overridden by `SKYFS_*` environment
//! variables, over compiled-in defaults. Everything is validated before
//! the engine sees it

use {
    core::fmt,
    serde::Deserialize,
    std::{env, fs, time::Duration},
};

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    FileRead(String),
    Parse(String),
    Validation(&'static str),
    EnvValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(p) => write!(f, "failed to read config file `{p}`"),
            ConfigError::Parse(e) => write!(f, "bad config file: {e}"),
            ConfigError::Validation(what) => write!(f, "bad config value for {what}"),
            ConfigError::EnvValue(var) => write!(f, "bad environment value in {var}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/*
    tunables
*/

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Engine knobs a volume is mounted with
pub struct Tunables {
    /// captured nodes before an atom is pushed toward commit
    pub atom_max_size: u32,
    /// atom age before the daemon commits it
    pub atom_max_age_ms: u64,
    /// lookup cache slots
    pub cbk_cache_slots: usize,
    /// background daemon tick
    pub entd_tick_ms: u64,
    /// use the wide key variant with the ordering word
    pub large_keys: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            atom_max_size: 4096,
            atom_max_age_ms: 30_000,
            cbk_cache_slots: 16,
            entd_tick_ms: 1_000,
            large_keys: false,
        }
    }
}

impl Tunables {
    pub fn atom_max_age(&self) -> Duration {
        Duration::from_millis(self.atom_max_age_ms)
    }
    pub fn entd_tick(&self) -> Duration {
        Duration::from_millis(self.entd_tick_ms)
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.atom_max_size == 0 {
            return Err(ConfigError::Validation("atom_max_size"));
        }
        if self.cbk_cache_slots == 0 || self.cbk_cache_slots > 4096 {
            return Err(ConfigError::Validation("cbk_cache_slots"));
        }
        if self.entd_tick_ms == 0 {
            return Err(ConfigError::Validation("entd_tick_ms"));
        }
        Ok(())
    }
}

/*
    top level config
*/

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// backing file or device
    pub volume: String,
    /// create a fresh volume of this many blocks instead of mounting
    #[serde(default)]
    pub mkfs_blocks: Option<u64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub tunables: Tunables,
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text =
            fs::read_to_string(path).map_err(|_| ConfigError::FileRead(path.to_owned()))?;
        let mut cfg = Self::from_yaml(&text)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }
    fn validate(&self) -> Result<(), ConfigError> {
        if self.volume.is_empty() {
            return Err(ConfigError::Validation("volume"));
        }
        if let Some(blocks) = self.mkfs_blocks {
            if blocks < 64 {
                return Err(ConfigError::Validation("mkfs_blocks"));
            }
        }
        if let Some(label) = &self.label {
            if label.len() > 16 {
                return Err(ConfigError::Validation("label"));
            }
        }
        self.tunables.validate()
    }
    /// `SKYFS_*` wins over the file
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        fn get_parsed<T: std::str::FromStr>(
            var: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match env::var(var) {
                Ok(v) => v.parse().map(Some).map_err(|_| ConfigError::EnvValue(var)),
                Err(_) => Ok(None),
            }
        }
        if let Ok(v) = env::var("SKYFS_VOLUME") {
            self.volume = v;
        }
        if let Some(v) = get_parsed::<u64>("SKYFS_MKFS_BLOCKS")? {
            self.mkfs_blocks = Some(v);
        }
        if let Some(v) = get_parsed::<u32>("SKYFS_ATOM_MAX_SIZE")? {
            self.tunables.atom_max_size = v;
        }
        if let Some(v) = get_parsed::<u64>("SKYFS_ATOM_MAX_AGE_MS")? {
            self.tunables.atom_max_age_ms = v;
        }
        if let Some(v) = get_parsed::<usize>("SKYFS_CBK_CACHE_SLOTS")? {
            self.tunables.cbk_cache_slots = v;
        }
        if let Some(v) = get_parsed::<u64>("SKYFS_ENTD_TICK_MS")? {
            self.tunables.entd_tick_ms = v;
        }
        if let Some(v) = get_parsed::<bool>("SKYFS_LARGE_KEYS")? {
            self.tunables.large_keys = v;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let t = Tunables::default();
        t.validate().unwrap();
        assert!(!t.large_keys);
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = Config::from_yaml(
            r#"
volume: /tmp/vol.skyfs
mkfs_blocks: 1024
tunables:
  atom_max_size: 128
  large_keys: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.volume, "/tmp/vol.skyfs");
        assert_eq!(cfg.mkfs_blocks, Some(1024));
        assert_eq!(cfg.tunables.atom_max_size, 128);
        assert!(cfg.tunables.large_keys);
        // defaults fill the gaps
        assert_eq!(cfg.tunables.cbk_cache_slots, 16);
    }

    #[test]
    fn bad_values_are_refused() {
        assert!(Config::from_yaml("volume: ''").is_err());
        assert!(Config::from_yaml("volume: x\nmkfs_blocks: 3").is_err());
        assert!(
            Config::from_yaml("volume: x\ntunables:\n  atom_max_size: 0").is_err()
        );
        assert!(Config::from_yaml("volume: x\nnot_a_key: 1").is_err());
    }
}
