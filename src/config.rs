use crate::builder::DEFAULT_PROPAGATE_ENVIRONMENT;
use crate::connection::{PeerConnection, TlsMaterial};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from runwarden.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub builder: BuilderConfig,
    pub instance: InstanceConfig,
    pub peer: PeerConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub name: String,
    pub location: PathBuf,
    pub propagate_environment: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub package_id: String,
    pub build_output_dir: PathBuf,
    /// 0 falls back to the built-in grace period.
    pub termination_grace_period_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct PeerConfig {
    pub address: String,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub root_cert: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            location: PathBuf::new(),
            propagate_environment: DEFAULT_PROPAGATE_ENVIRONMENT
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            package_id: String::new(),
            build_output_dir: PathBuf::from("."),
            termination_grace_period_secs: 5,
        }
    }
}

/// Errors produced while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(SupervisorConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl SupervisorConfig {
    /// Check that everything needed to start an instance is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.builder.name.trim().is_empty() {
            return Err(ConfigError::Invalid("builder.name must be set".into()));
        }
        if self.builder.location.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("builder.location must be set".into()));
        }
        if self.instance.package_id.trim().is_empty() {
            return Err(ConfigError::Invalid("instance.package_id must be set".into()));
        }
        if self.peer.address.trim().is_empty() {
            return Err(ConfigError::Invalid("peer.address must be set".into()));
        }
        self.peer.tls_paths()?;
        Ok(())
    }
}

impl InstanceConfig {
    pub fn termination_grace_period(&self) -> Option<Duration> {
        match self.termination_grace_period_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl PeerConfig {
    /// All three TLS paths, or none of them.
    fn tls_paths(&self) -> Result<Option<[&Path; 3]>, ConfigError> {
        match (&self.client_cert, &self.client_key, &self.root_cert) {
            (Some(cert), Some(key), Some(root)) => {
                Ok(Some([cert.as_path(), key.as_path(), root.as_path()]))
            }
            (None, None, None) => Ok(None),
            _ => Err(ConfigError::Invalid(
                "peer.client_cert, peer.client_key and peer.root_cert must be set together".into(),
            )),
        }
    }

    /// Read the TLS files (if any) into a connection payload.
    pub fn load_connection(&self) -> Result<PeerConnection, ConfigError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        };
        let tls = match self.tls_paths()? {
            Some([cert, key, root]) => Some(TlsMaterial {
                client_cert: read(cert)?,
                client_key: read(key)?,
                root_cert: read(root)?,
            }),
            None => None,
        };
        Ok(PeerConnection {
            address: self.address.clone(),
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.builder.name = "golang".into();
        config.builder.location = PathBuf::from("/builders/golang");
        config.instance.package_id = "mycc:1.0".into();
        config.peer.address = "127.0.0.1:7052".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.instance.termination_grace_period_secs, 5);
        assert_eq!(config.instance.build_output_dir, PathBuf::from("."));
        assert_eq!(
            config.builder.propagate_environment,
            vec!["LD_LIBRARY_PATH", "LIBPATH", "PATH", "TMPDIR"]
        );
        assert!(config.peer.client_cert.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config: SupervisorConfig = toml::from_str(
            r#"
[builder]
name = "golang"
location = "/builders/golang"
propagate_environment = ["PATH"]

[instance]
package_id = "mycc:1.0"
build_output_dir = "/work/build"
termination_grace_period_secs = 30

[peer]
address = "peer0:7052"
client_cert = "tls/client.crt"
client_key = "tls/client.key"
root_cert = "tls/ca.crt"
"#,
        )
        .unwrap();
        assert_eq!(config.builder.name, "golang");
        assert_eq!(config.builder.propagate_environment, vec!["PATH"]);
        assert_eq!(config.instance.build_output_dir, PathBuf::from("/work/build"));
        assert_eq!(
            config.instance.termination_grace_period(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.peer.root_cert, Some(PathBuf::from("tls/ca.crt")));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: SupervisorConfig = toml::from_str("[builder]\nname = \"x\"\n").unwrap();
        assert_eq!(config.builder.name, "x");
        assert_eq!(config.builder.propagate_environment.len(), 4);
        assert_eq!(config.instance.termination_grace_period_secs, 5);
    }

    #[test]
    fn test_zero_grace_period_means_default() {
        let mut config = InstanceConfig::default();
        config.termination_grace_period_secs = 0;
        assert_eq!(config.termination_grace_period(), None);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("runwarden.toml")).unwrap();
        assert_eq!(config.instance.termination_grace_period_secs, 5);
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runwarden.toml");
        std::fs::write(&path, "[builder\nname = ").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("failed to parse"));
    }

    #[test]
    fn test_validate_requires_fields() {
        valid().validate().unwrap();

        let mut config = valid();
        config.builder.name.clear();
        assert!(config.validate().unwrap_err().to_string().contains("builder.name"));

        let mut config = valid();
        config.instance.package_id = "  ".into();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("instance.package_id"));

        let mut config = valid();
        config.peer.address.clear();
        assert!(config.validate().unwrap_err().to_string().contains("peer.address"));
    }

    #[test]
    fn test_validate_rejects_partial_tls() {
        let mut config = valid();
        config.peer.client_cert = Some(PathBuf::from("client.crt"));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_connection_reads_tls_files() {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [("c.crt", "cert"), ("c.key", "key"), ("ca.crt", "root")] {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let peer = PeerConfig {
            address: "peer0:7052".into(),
            client_cert: Some(dir.path().join("c.crt")),
            client_key: Some(dir.path().join("c.key")),
            root_cert: Some(dir.path().join("ca.crt")),
        };
        let conn = peer.load_connection().unwrap();
        assert_eq!(conn.address, "peer0:7052");
        let tls = conn.tls.unwrap();
        assert_eq!(tls.client_cert, b"cert");
        assert_eq!(tls.client_key, b"key");
        assert_eq!(tls.root_cert, b"root");
    }

    #[test]
    fn test_load_connection_without_tls() {
        let peer = PeerConfig {
            address: "127.0.0.1:7052".into(),
            ..Default::default()
        };
        assert_eq!(peer.load_connection().unwrap().tls, None);
    }

    #[test]
    fn test_load_connection_missing_file() {
        let peer = PeerConfig {
            address: "peer0:7052".into(),
            client_cert: Some(PathBuf::from("/nonexistent/c.crt")),
            client_key: Some(PathBuf::from("/nonexistent/c.key")),
            root_cert: Some(PathBuf::from("/nonexistent/ca.crt")),
        };
        assert!(matches!(
            peer.load_connection().unwrap_err(),
            ConfigError::Read { .. }
        ));
    }
}
