//! Target configuration loading and validation.
//!
//! The config file is a YAML document with a single top-level `targets`
//! list. Optional fields get defaults here so the rest of the crate only
//! ever sees fully resolved [`TargetSpec`] values.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_ROTATION_COUNT: u32 = 10;

/// One capture target as declared in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    /// Unique identifier; also the registry key for the running capturer.
    pub name: String,
    /// Hostname or IP address of the capture host.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH login.
    pub user: String,
    /// Path to the private key used for authentication.
    pub key: PathBuf,
    /// Directory receiving the rotated capture files.
    pub destination: PathBuf,
    /// Filename prefix; index and `.pcap` extension are appended.
    pub file_pattern: String,
    /// Number of rotated files kept in addition to the one being written.
    #[serde(default = "default_rotation_count")]
    pub file_rotation_count: u32,
    /// Run the remote sniffer under `sudo -n`.
    #[serde(default)]
    pub use_sudo: bool,
    /// Sudo target user. Defaults to root when unset.
    #[serde(default)]
    pub sudo_user: Option<String>,
    /// Restrict the capture to a single TCP/UDP port.
    #[serde(default)]
    pub filter_port: Option<u16>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_rotation_count() -> u32 {
    DEFAULT_ROTATION_COUNT
}

/// The parsed configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub targets: Vec<TargetSpec>,
}

impl Config {
    /// Read and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.name.clone()));
            }

            // A u16 already caps the value at 65535; zero is the one
            // remaining out-of-range encoding.
            if target.filter_port == Some(0) {
                return Err(ConfigError::InvalidFilterPort {
                    name: target.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Names of all configured targets, in declaration order.
    pub fn target_names(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.name.clone()).collect()
    }
}

/// Write a fully commented sample configuration to `path`.
///
/// Refuses to overwrite an existing file.
pub fn write_sample(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::SampleExists(path.to_path_buf()));
    }

    fs::write(path, SAMPLE_CONFIG).map_err(ConfigError::SampleWrite)
}

const SAMPLE_CONFIG: &str = "\
# remcap target configuration.
#
# Every entry under `targets` describes one remote host to capture on.
# Mandatory fields: name, host, user, key, destination, file_pattern.
targets:
    # Unique identifier for this target; also used as the argument to the
    # wireshark command.
  - name: edge-router
    # Hostname or IP address of the capture host.
    host: 192.0.2.10
    # SSH port. Defaults to 22 when omitted.
    port: 22
    # SSH login.
    user: ops
    # Path to the private key used for authentication.
    key: /home/ops/.ssh/id_ed25519
    # Directory receiving the rotated capture files. Must differ between
    # targets unless the file patterns differ.
    destination: /var/tmp/remcap
    # Filename prefix for each capture file; an index and the .pcap
    # extension are appended.
    file_pattern: edge_
    # Number of rotated files kept in addition to the one currently being
    # written. Defaults to 10. 0 keeps only the active file.
    file_rotation_count: 10
    # Run the remote sniffer under sudo -n. Requires passwordless sudo.
    use_sudo: false
    # Sudo target user; defaults to root when omitted.
    # sudo_user: pcap
    # Restrict the capture to a single TCP/UDP port.
    # filter_port: 443
";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("remcap.yml");
        fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL: &str = "\
targets:
  - name: alpha
    host: 10.0.0.1
    user: ops
    key: /tmp/key
    destination: /tmp/caps
    file_pattern: alpha_
";

    #[test]
    fn minimal_target_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, MINIMAL);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.targets.len(), 1);

        let target = &config.targets[0];
        assert_eq!(target.name, "alpha");
        assert_eq!(target.port, 22);
        assert_eq!(target.file_rotation_count, 10);
        assert!(!target.use_sudo);
        assert!(target.sudo_user.is_none());
        assert!(target.filter_port.is_none());
    }

    #[test]
    fn missing_mandatory_field_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "targets:\n  - name: alpha\n    host: 10.0.0.1\n    user: ops\n",
        );

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_rejected_with_hint() {
        let err = Config::load(Path::new("/nonexistent/remcap.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("init"));
    }

    #[test]
    fn empty_targets_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "targets: []\n");

        assert!(matches!(Config::load(&path), Err(ConfigError::NoTargets)));
    }

    #[test]
    fn duplicate_names_rejected() {
        let dir = TempDir::new().unwrap();
        let doubled = format!(
            "{}  - name: alpha\n    host: 10.0.0.2\n    user: ops\n    key: /tmp/key\n    destination: /tmp/caps2\n    file_pattern: alpha2_\n",
            MINIMAL
        );
        let path = write_config(&dir, &doubled);

        match Config::load(&path) {
            Err(ConfigError::DuplicateTarget(name)) => assert_eq!(name, "alpha"),
            other => panic!("expected duplicate target error, got {other:?}"),
        }
    }

    #[test]
    fn zero_filter_port_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &format!("{}    filter_port: 0\n", MINIMAL));

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidFilterPort { .. })
        ));
    }

    #[test]
    fn sudo_and_filter_fields_parsed() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            &format!(
                "{}    use_sudo: true\n    sudo_user: pcap\n    filter_port: 443\n",
                MINIMAL
            ),
        );

        let config = Config::load(&path).unwrap();
        let target = &config.targets[0];
        assert!(target.use_sudo);
        assert_eq!(target.sudo_user.as_deref(), Some("pcap"));
        assert_eq!(target.filter_port, Some(443));
    }

    #[test]
    fn sample_round_trips_through_loader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.yml");

        write_sample(&path).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.target_names(), vec!["edge-router"]);
    }

    #[test]
    fn sample_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.yml");
        fs::write(&path, "keep me").unwrap();

        assert!(matches!(
            write_sample(&path),
            Err(ConfigError::SampleExists(_))
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn target_names_in_declaration_order() {
        let dir = TempDir::new().unwrap();
        let two = format!(
            "{}  - name: beta\n    host: 10.0.0.2\n    user: ops\n    key: /tmp/key\n    destination: /tmp/caps2\n    file_pattern: beta_\n",
            MINIMAL
        );
        let path = write_config(&dir, &two);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.target_names(), vec!["alpha", "beta"]);
    }
}
