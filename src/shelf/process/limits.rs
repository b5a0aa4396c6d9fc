//! Resource limits for external-process workers
//!
//! Limits are applied inside the child between fork and exec, so they bind
//! the worker only and never the host.

use serde::{Deserialize, Serialize};

/// Resource limits for a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum address space (bytes)
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    /// Maximum number of open file descriptors
    #[serde(default)]
    pub max_file_descriptors: Option<u64>,
    /// Maximum number of processes for the worker's user
    #[serde(default)]
    pub max_child_processes: Option<u64>,
}

impl ResourceLimits {
    /// Whether this build can apply limits to worker processes
    pub const ENFORCEABLE: bool = cfg!(all(unix, feature = "nix"));

    /// Whether no limit is set
    pub fn is_empty(&self) -> bool {
        self.max_memory_bytes.is_none()
            && self.max_file_descriptors.is_none()
            && self.max_child_processes.is_none()
    }

    /// Apply the limits to the calling process
    ///
    /// Runs in the forked child before exec: no allocation, no logging.
    #[cfg(all(unix, feature = "nix"))]
    pub fn apply_to_current_process(&self) -> std::io::Result<()> {
        use nix::sys::resource::{setrlimit, Resource};

        if let Some(max_memory) = self.max_memory_bytes {
            setrlimit(Resource::RLIMIT_AS, max_memory, max_memory)?;
        }
        if let Some(max_fds) = self.max_file_descriptors {
            setrlimit(Resource::RLIMIT_NOFILE, max_fds, max_fds)?;
        }
        if let Some(max_children) = self.max_child_processes {
            setrlimit(Resource::RLIMIT_NPROC, max_children, max_children)?;
        }
        Ok(())
    }

    /// No-op without the `nix` feature
    #[cfg(not(all(unix, feature = "nix")))]
    pub fn apply_to_current_process(&self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_empty() {
        assert!(ResourceLimits::default().is_empty());

        let limits = ResourceLimits {
            max_file_descriptors: Some(256),
            ..Default::default()
        };
        assert!(!limits.is_empty());
    }

    #[test]
    fn test_enforceable_follows_build() {
        assert_eq!(
            ResourceLimits::ENFORCEABLE,
            cfg!(all(unix, feature = "nix"))
        );
    }

    #[test]
    fn test_limits_deserialize_partially() {
        let limits: ResourceLimits = toml::from_str("max_memory_bytes = 536870912").unwrap();
        assert_eq!(limits.max_memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(limits.max_child_processes, None);
    }
}
