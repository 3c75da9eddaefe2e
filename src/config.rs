//! Harness settings read from the environment.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `LOCAL_RANK` | rank of this process | `0` |
//! | `LOCAL_WORLD_SIZE` | number of participating processes | `1` |
//! | `HSA_REPRO_BACKEND` | `kfd` or `host` | `kfd` if `/dev/kfd` exists |
//! | `HSA_REPRO_HOST_DEVICES` | emulated device count | world size |
//! | `HSA_REPRO_HOST_CAPACITY` | bytes per emulated device, `K`/`M`/`G` suffix allowed | `4G` |
//! | `HSA_REPRO_ITERATIONS` | stress loop bound | unbounded |
//! | `HSA_REPRO_RENDEZVOUS` | directory for the file all-gather | none |
//! | `HSA_REPRO_LOG` | tracing filter | `info` |

use crate::driver::MemoryDriver;
use crate::driver::host::HostDriver;
use crate::driver::kfd::KfdDriver;
use crate::error::{ReproError, ReproResult};
use crate::kfd::device::KfdDevice;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_HOST_CAPACITY: u64 = 4 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Kfd,
    Host,
}

impl FromStr for Backend {
    type Err = ReproError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kfd" => Ok(Self::Kfd),
            "host" => Ok(Self::Host),
            other => Err(ReproError::Config(format!(
                "unknown backend '{other}' (expected kfd or host)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub rank: usize,
    pub world_size: usize,
    pub backend: Backend,
    pub host_devices: u32,
    pub host_capacity: u64,
    pub iterations: Option<u64>,
    pub rendezvous: Option<PathBuf>,
    pub log_filter: String,
}

fn parse_var<T: FromStr>(name: &str, raw: Option<String>) -> ReproResult<Option<T>> {
    raw.map(|v| {
        v.trim()
            .parse::<T>()
            .map_err(|_| ReproError::Config(format!("{name}='{v}' is not a valid value")))
    })
    .transpose()
}

/// Parses a byte count such as `1048576`, `512M` or `4G`.
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (digits, shift) = match raw.char_indices().last()? {
        (i, 'k' | 'K') => (&raw[..i], 10),
        (i, 'm' | 'M') => (&raw[..i], 20),
        (i, 'g' | 'G') => (&raw[..i], 30),
        _ => (raw, 0),
    };
    digits.parse::<u64>().ok()?.checked_mul(1 << shift)
}

impl HarnessConfig {
    pub fn from_env() -> ReproResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ReproResult<Self> {
        let rank = parse_var("LOCAL_RANK", lookup("LOCAL_RANK"))?.unwrap_or(0);
        let world_size = parse_var("LOCAL_WORLD_SIZE", lookup("LOCAL_WORLD_SIZE"))?.unwrap_or(1);
        if world_size == 0 || rank >= world_size {
            return Err(ReproError::Config(format!(
                "LOCAL_RANK={rank} is outside LOCAL_WORLD_SIZE={world_size}"
            )));
        }

        let backend = match lookup("HSA_REPRO_BACKEND") {
            Some(v) => v.parse()?,
            None if KfdDevice::is_present() => Backend::Kfd,
            None => Backend::Host,
        };

        let host_devices = parse_var("HSA_REPRO_HOST_DEVICES", lookup("HSA_REPRO_HOST_DEVICES"))?
            .unwrap_or(world_size as u32);
        if host_devices == 0 {
            return Err(ReproError::Config("HSA_REPRO_HOST_DEVICES must be at least 1".into()));
        }

        let host_capacity = match lookup("HSA_REPRO_HOST_CAPACITY") {
            Some(v) => parse_size(&v).ok_or_else(|| {
                ReproError::Config(format!("HSA_REPRO_HOST_CAPACITY='{v}' is not a size"))
            })?,
            None => DEFAULT_HOST_CAPACITY,
        };

        let iterations = parse_var("HSA_REPRO_ITERATIONS", lookup("HSA_REPRO_ITERATIONS"))?;
        let rendezvous = lookup("HSA_REPRO_RENDEZVOUS")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let log_filter = lookup("HSA_REPRO_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            rank,
            world_size,
            backend,
            host_devices,
            host_capacity,
            iterations,
            rendezvous,
            log_filter,
        })
    }

    /// Device this rank drives: one device per rank, as the launcher assigns them.
    #[must_use]
    pub fn device(&self) -> u32 {
        self.rank as u32
    }
}

/// Opens the driver selected by `config`.
pub fn open_driver(config: &HarnessConfig) -> ReproResult<Arc<dyn MemoryDriver>> {
    let driver: Arc<dyn MemoryDriver> = match config.backend {
        Backend::Kfd => Arc::new(KfdDriver::open()?),
        Backend::Host => Arc::new(HostDriver::new(config.host_devices, config.host_capacity)),
    };
    tracing::info!(
        driver = driver.name(),
        devices = driver.device_count(),
        rank = config.rank,
        world_size = config.world_size,
        "opened memory driver"
    );
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ReproResult<HarnessConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        HarnessConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[("HSA_REPRO_BACKEND", "host")]).unwrap();
        assert_eq!(c.rank, 0);
        assert_eq!(c.world_size, 1);
        assert_eq!(c.backend, Backend::Host);
        assert_eq!(c.host_devices, 1);
        assert_eq!(c.host_capacity, DEFAULT_HOST_CAPACITY);
        assert_eq!(c.iterations, None);
        assert_eq!(c.rendezvous, None);
        assert_eq!(c.log_filter, "info");
    }

    #[test]
    fn launcher_variables() {
        let c = config(&[
            ("LOCAL_RANK", "2"),
            ("LOCAL_WORLD_SIZE", "4"),
            ("HSA_REPRO_BACKEND", "HOST"),
            ("HSA_REPRO_HOST_CAPACITY", "512M"),
            ("HSA_REPRO_ITERATIONS", "100"),
            ("HSA_REPRO_RENDEZVOUS", "/tmp/rdv"),
        ])
        .unwrap();
        assert_eq!(c.device(), 2);
        assert_eq!(c.host_devices, 4);
        assert_eq!(c.host_capacity, 512 << 20);
        assert_eq!(c.iterations, Some(100));
        assert_eq!(c.rendezvous, Some(PathBuf::from("/tmp/rdv")));
    }

    #[test]
    fn rejects_bad_values() {
        for vars in [
            &[("LOCAL_RANK", "x")][..],
            &[("LOCAL_RANK", "4"), ("LOCAL_WORLD_SIZE", "4")][..],
            &[("HSA_REPRO_BACKEND", "cuda")][..],
            &[("HSA_REPRO_BACKEND", "host"), ("HSA_REPRO_HOST_CAPACITY", "lots")][..],
            &[("HSA_REPRO_BACKEND", "host"), ("HSA_REPRO_HOST_DEVICES", "0")][..],
        ] {
            assert!(
                matches!(config(vars), Err(ReproError::Config(_))),
                "{vars:?} should be rejected"
            );
        }
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("2k"), Some(2048));
        assert_eq!(parse_size("3G"), Some(3 << 30));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("G"), None);
        assert_eq!(parse_size("99999999999G"), None);
    }
}
