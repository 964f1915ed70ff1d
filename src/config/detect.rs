//! Agent CLI path autodetection.
//!
//! Scans the places the agent CLI is conventionally installed and proposes
//! `agentPath`/`toolchainBin` updates. The heuristic is intentionally
//! shallow: first hit wins, and a configured path that still exists is
//! left alone.

use std::path::{Path, PathBuf};

use super::Config;

/// Name of the agent CLI binary.
const AGENT_BINARY: &str = "claude";

/// Proposed configuration updates.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPaths {
    pub agent_path: String,
    pub toolchain_bin: Option<String>,
}

/// Locate the agent CLI. Returns `None` when the configured path is still
/// valid or nothing better is found.
pub fn detect_agent_paths(config: &Config) -> Option<DetectedPaths> {
    if let Some(path) = &config.agent_path {
        if is_executable(Path::new(path)) {
            return None;
        }
        tracing::warn!("Configured agent path {} no longer exists", path);
    }

    let binary = find_agent_binary()?;
    let toolchain_bin = binary
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned());

    Some(DetectedPaths {
        agent_path: binary.to_string_lossy().into_owned(),
        toolchain_bin,
    })
}

/// Merge detected paths into the configuration. Returns `true` when a
/// field changed.
pub fn apply_detected(config: &mut Config, detected: &DetectedPaths) -> bool {
    let mut changed = false;
    if config.agent_path.as_deref() != Some(detected.agent_path.as_str()) {
        config.agent_path = Some(detected.agent_path.clone());
        changed = true;
    }
    if config.toolchain_bin.is_none() && detected.toolchain_bin.is_some() {
        config.toolchain_bin = detected.toolchain_bin.clone();
        changed = true;
    }
    changed
}

fn find_agent_binary() -> Option<PathBuf> {
    for dir in search_dirs() {
        let candidate = dir.join(AGENT_BINARY);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    if let Some(path) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&path));
    }

    // Node installed through nvm keeps one bin directory per version.
    if let Ok(nvm_dir) = std::env::var("NVM_DIR") {
        let versions = PathBuf::from(nvm_dir).join("versions").join("node");
        if let Ok(entries) = std::fs::read_dir(&versions) {
            for entry in entries.flatten() {
                dirs.push(entry.path().join("bin"));
            }
        }
    }

    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        dirs.push(home.join(".local").join("bin"));
        dirs.push(home.join("bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));

    dirs
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_valid_configured_path_is_left_alone() {
        let dir = tempdir().unwrap();
        let binary = dir.path().join("claude");
        std::fs::write(&binary, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = Config {
            agent_path: Some(binary.to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert_eq!(detect_agent_paths(&config), None);
    }

    #[test]
    fn test_apply_detected_reports_changes() {
        let mut config = Config::default();
        let detected = DetectedPaths {
            agent_path: "/usr/local/bin/claude".to_string(),
            toolchain_bin: Some("/usr/local/bin".to_string()),
        };

        assert!(apply_detected(&mut config, &detected));
        assert_eq!(config.agent_path.as_deref(), Some("/usr/local/bin/claude"));
        assert_eq!(config.toolchain_bin.as_deref(), Some("/usr/local/bin"));

        // Applying the same detection again is a no-op.
        assert!(!apply_detected(&mut config, &detected));
    }
}
