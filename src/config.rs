//! Optional `~/.config/taskstow.toml`: store tuning knobs not mandated by
//! the spec but natural for a persistent cache (§10.3 of `SPEC_FULL.md`).

use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

#[inline]
fn default_max_entries() -> u64 {
    100_000
}

#[inline]
fn default_cache_in_memory() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Upper bound on how many task-history records the store keeps before
    /// it starts evicting the least recently used ones. Mirrors the
    /// `maxEntries` knob `PersistentIndexedCache::createCache` takes (§6).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Whether hot records should also be cached in memory, per
    /// `PersistentIndexedCache::createCache`'s `cacheInMemory` flag (§6).
    #[serde(default = "default_cache_in_memory")]
    pub cache_in_memory: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            cache_in_memory: default_cache_in_memory(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "taskstow.toml"]);
    load_from(&confpath)
}

pub fn load_from(path: &Utf8PathBuf) -> Result<Configuration> {
    let s = match fs::read_to_string(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {path}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {path}"))?;
    Ok(conf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nope.toml")).unwrap();
        let conf = load_from(&path)?;
        assert_eq!(conf.max_entries, default_max_entries());
        assert!(conf.cache_in_memory);
        Ok(())
    }

    #[test]
    fn parses_partial_overrides() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().join("taskstow.toml")).unwrap();
        fs::write(&path, "max_entries = 5\n")?;
        let conf = load_from(&path)?;
        assert_eq!(conf.max_entries, 5);
        assert!(conf.cache_in_memory);
        Ok(())
    }
}
