#![allow(clippy::cast_possible_truncation)]

use std::fs;
use std::io;
use std::path::Path;

const KFD_SYSFS_PATH: &str = "/sys/devices/virtual/kfd/kfd/topology";

/// The subset of a KFD topology node's properties needed to drive device memory.
#[derive(Debug, Clone, Default)]
pub struct HsaNodeProperties {
    pub node_id: u32,
    pub simd_count: u32,
    pub drm_render_minor: i32,
    pub kfd_gpu_id: u32,
    pub local_mem_size: u64,
}

impl HsaNodeProperties {
    /// CPU-only nodes report no SIMDs.
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        self.simd_count > 0 && self.kfd_gpu_id != 0
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub nodes: Vec<HsaNodeProperties>,
}

impl Topology {
    /// Scans every node under the KFD sysfs topology, ordered by node index.
    pub fn get_snapshot() -> io::Result<Self> {
        let root = Path::new(KFD_SYSFS_PATH);
        if !root.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "KFD topology not found",
            ));
        }

        let mut paths: Vec<_> = fs::read_dir(root.join("nodes"))?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();

        paths.sort_by_key(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(u32::MAX)
        });

        let mut nodes = Vec::with_capacity(paths.len());
        for (idx, path) in paths.iter().enumerate() {
            let Ok(mut props) = Self::parse_node(path) else {
                tracing::debug!(path = %path.display(), "skipping unreadable topology node");
                continue;
            };
            props.node_id = idx as u32;
            nodes.push(props);
        }

        Ok(Self { nodes })
    }

    /// GPU nodes in topology order. The position in this list is the device index
    /// used throughout the crate.
    #[must_use]
    pub fn gpu_nodes(&self) -> Vec<HsaNodeProperties> {
        self.nodes.iter().filter(|n| n.is_gpu()).cloned().collect()
    }

    fn parse_node(path: &Path) -> io::Result<HsaNodeProperties> {
        let content = fs::read_to_string(path.join("properties"))?;
        let mut props = parse_node_properties(&content);

        if props.kfd_gpu_id == 0
            && let Ok(txt) = fs::read_to_string(path.join("gpu_id"))
            && let Ok(val) = txt.trim().parse::<u32>()
        {
            props.kfd_gpu_id = val;
        }

        Ok(props)
    }
}

/// Parses the `key value` lines of a node `properties` file.
pub fn parse_node_properties(content: &str) -> HsaNodeProperties {
    let mut p = HsaNodeProperties::default();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(k), Some(v)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(val) = v.parse::<u64>() else {
            continue;
        };
        match k {
            "simd_count" => p.simd_count = val as u32,
            "drm_render_minor" => p.drm_render_minor = val as i32,
            "local_mem_size" => p.local_mem_size = val,
            _ => {}
        }
    }

    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gpu_node_properties() {
        let content = "\
cpu_cores_count 0
simd_count 304
vendor_id 4098
device_id 29772
location_id 49920
drm_render_minor 128
local_mem_size 206141652992
gfx_target_version 90402
";
        let props = parse_node_properties(content);
        assert_eq!(props.simd_count, 304);
        assert_eq!(props.drm_render_minor, 128);
        assert_eq!(props.local_mem_size, 206_141_652_992);
        // `gpu_id` lives in its own file, not in `properties`.
        assert_eq!(props.kfd_gpu_id, 0);
    }

    #[test]
    fn cpu_nodes_are_not_gpus() {
        let props = parse_node_properties("cpu_cores_count 64\nsimd_count 0\n");
        assert!(!props.is_gpu());
    }

    #[test]
    fn ignores_malformed_lines() {
        let props = parse_node_properties("simd_count\nname gfx942\nsimd_count 4\n");
        assert_eq!(props.simd_count, 4);
    }
}
