//! Registration of unary providers found as Unix sockets in a directory.
//!
//! A plugin that serves `TokenProviderService` on `<dir>/<name>.sock` is
//! registered under `<name>`. Channels connect lazily, so a socket that is
//! not accepting yet only fails the calls made while it is down.

use crate::provider::{ProviderHandle, UnaryProvider};
use crate::registry::Registry;
use core::time::Duration;
use std::path::{Path, PathBuf};
use token_renewer_tonic_core::SOCKET_EXTENSION;

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("Unable to read plugin directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to register discovered provider: {0}")]
    Register(#[from] crate::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredSocket {
    pub name: String,
    pub path: PathBuf,
}

/// Lists `*.sock` entries of `dir`, sorted by provider name.
///
/// # Errors
///
/// [`DiscoveryError::ReadDir`] if the directory cannot be listed.
pub fn discover_sockets(dir: &Path) -> Result<Vec<DiscoveredSocket>, DiscoveryError> {
    let read_err = |source| DiscoveryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };
    let dir = std::path::absolute(dir).map_err(read_err)?;

    let mut found = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(SOCKET_EXTENSION) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            tracing::warn!(path = %path.display(), "Skipping socket with a non UTF-8 name");
            continue;
        };
        if name.is_empty() {
            continue;
        }
        found.push(DiscoveredSocket {
            name: name.to_string(),
            path,
        });
    }

    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

/// A lazily connected channel over a Unix domain socket.
#[cfg(unix)]
pub fn unix_channel(path: impl Into<PathBuf>) -> tonic::transport::Channel {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tonic::transport::{Endpoint, Uri};
    use tower::service_fn;

    let path = path.into();
    // The URI is required by the builder but never dialed.
    Endpoint::from_static("http://[::]:50051").connect_with_connector_lazy(service_fn(
        move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        },
    ))
}

/// Discovers sockets in `dir` and registers each as a unary provider.
///
/// Must be called from within a Tokio runtime. Returns the registered names.
///
/// # Errors
///
/// Fails if the directory cannot be read or the registry is shutting down.
#[cfg(unix)]
pub fn register_discovered(
    registry: &Registry,
    dir: &Path,
    call_timeout: Duration,
) -> Result<Vec<String>, DiscoveryError> {
    let sockets = discover_sockets(dir)?;
    let mut names = Vec::with_capacity(sockets.len());
    for socket in sockets {
        tracing::info!(
            provider = %socket.name,
            path = %socket.path.display(),
            "Discovered provider socket"
        );
        let provider = UnaryProvider::new(unix_channel(&socket.path), call_timeout);
        registry.register(socket.name.clone(), ProviderHandle::Unary(provider))?;
        names.push(socket.name);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn finds_only_socket_files() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("linode.sock")).unwrap();
        File::create(dir.path().join("aws.sock")).unwrap();
        File::create(dir.path().join("README.md")).unwrap();
        std::fs::create_dir(dir.path().join("nested.sock")).unwrap();

        let found = discover_sockets(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["aws", "linode"]);
        assert!(found.iter().all(|s| s.path.is_absolute()));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_sockets(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, DiscoveryError::ReadDir { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn registers_lazily_connected_providers() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("linode.sock")).unwrap();

        let registry = Registry::new();
        let names = register_discovered(&registry, dir.path(), Duration::from_secs(1)).unwrap();
        assert_eq!(names, ["linode"]);
        assert_eq!(registry.get("linode").unwrap().transport(), "unary");
    }
}
