/// Connection payload forwarded to the run program.
///
/// The supervisor never interprets the address or TLS material; it only
/// serializes them into `connection.json` inside a fresh run-metadata
/// directory that the child reads at startup.
use serde::Serialize;
use std::path::Path;
use tempfile::TempDir;

/// File name of the payload inside the run-metadata directory.
pub const METADATA_FILE: &str = "connection.json";

/// Where the child should connect back to, and with which credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConnection {
    pub address: String,
    /// Absent for unauthenticated/local connections.
    pub tls: Option<TlsMaterial>,
}

/// Raw PEM blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
    pub root_cert: Vec<u8>,
}

/// JSON document written to `connection.json`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RunMetadata {
    pub package_id: String,
    pub peer_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cert: Option<String>,
}

fn pem(blob: &[u8]) -> String {
    String::from_utf8_lossy(blob).into_owned()
}

impl RunMetadata {
    pub fn new(package_id: &str, connection: &PeerConnection) -> Self {
        let tls = connection.tls.as_ref();
        Self {
            package_id: package_id.to_string(),
            peer_address: connection.address.clone(),
            client_cert: tls.map(|t| pem(&t.client_cert)),
            client_key: tls.map(|t| pem(&t.client_key)),
            root_cert: tls.map(|t| pem(&t.root_cert)),
        }
    }

    /// Write the metadata into `dir`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(dir.join(METADATA_FILE), json)
    }

    /// Create a new run-metadata directory and write the metadata into it.
    /// The directory is removed when the returned handle is dropped or closed.
    pub fn write_to_temp_dir(&self) -> std::io::Result<TempDir> {
        let dir = tempfile::Builder::new().prefix("runwarden-run-").tempdir()?;
        self.write_to(dir.path())?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tls_connection() -> PeerConnection {
        PeerConnection {
            address: "peer.example.com:7052".to_string(),
            tls: Some(TlsMaterial {
                client_cert: b"fake-client-cert".to_vec(),
                client_key: b"fake-client-key".to_vec(),
                root_cert: b"fake-root-cert".to_vec(),
            }),
        }
    }

    #[test]
    fn test_metadata_with_tls() {
        let meta = RunMetadata::new("mycc:1.0", &tls_connection());
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["package_id"], "mycc:1.0");
        assert_eq!(value["peer_address"], "peer.example.com:7052");
        assert_eq!(value["client_cert"], "fake-client-cert");
        assert_eq!(value["client_key"], "fake-client-key");
        assert_eq!(value["root_cert"], "fake-root-cert");
    }

    #[test]
    fn test_metadata_without_tls_omits_credentials() {
        let conn = PeerConnection {
            address: "127.0.0.1:7052".to_string(),
            tls: None,
        };
        let value = serde_json::to_value(RunMetadata::new("mycc:1.0", &conn)).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert!(!object.contains_key("client_cert"));
        assert!(!object.contains_key("root_cert"));
    }

    #[test]
    fn test_write_to_temp_dir() {
        let meta = RunMetadata::new("mycc:1.0", &tls_connection());
        let dir = meta.write_to_temp_dir().unwrap();
        let path = dir.path().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("runwarden-run-"));

        let contents = std::fs::read_to_string(path.join(METADATA_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["root_cert"], "fake-root-cert");

        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn test_write_to_missing_dir_fails() {
        let meta = RunMetadata::new("mycc:1.0", &PeerConnection::default());
        let err = meta
            .write_to(Path::new("/nonexistent-dir/impossible"))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
