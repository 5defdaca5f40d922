use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::MAX_CLIENTS;
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Bootstrap parameters for [`Server::create`](crate::Server::create).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerConfig {
    /// Port to listen on; 0 lets the OS choose.
    pub port: u16,
    /// PEM certificate chain. The server terminates TLS when both this
    /// and `key_path` are set.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key matching `cert_path`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Group id to drop to once the listener is bound.
    #[serde(default)]
    pub gid: Option<u32>,
    /// User id to drop to once the listener is bound.
    #[serde(default)]
    pub uid: Option<u32>,
    /// Descriptor table capacity; the listener and the per-protocol
    /// rendezvous slots count against it too.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

fn default_max_clients() -> usize {
    MAX_CLIENTS
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: 0,
            cert_path: None,
            key_path: None,
            gid: None,
            uid: None,
            max_clients: MAX_CLIENTS,
        }
    }
}

impl ServerConfig {
    #[inline]
    pub fn new(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            ..Default::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> NetworkResult<ServerConfig> {
        serdeconv::from_toml_file(path).map_err(|_| NetworkError::Fatal(ErrorType::Config))
    }

    pub fn from_toml_str(config: &str) -> NetworkResult<ServerConfig> {
        serdeconv::from_toml_str(config).map_err(|_| NetworkError::Fatal(ErrorType::Config))
    }
}
