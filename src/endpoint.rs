//! Filesystem artifacts used to discover, start and stop a portal.
//!
//! All artifacts are siblings in one coordination directory:
//! - the endpoint itself (a port file, or the Unix socket path)
//! - [`STARTING_LOCK_NAME`], created exclusively by the client that spawns the portal
//! - [`STOP_SENTINEL_NAME`], whose creation asks the running portal to shut down
//!
//! Exclusive file creation is the only cross-process synchronization primitive.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::{PortalConfig, TransportKind};
use crate::error::PortalError;

/// File name of the "a portal is starting" lock.
pub const STARTING_LOCK_NAME: &str = "server.port.starting";

/// File name of the stop request sentinel.
pub const STOP_SENTINEL_NAME: &str = "server.port.stop";

/// Where a portal listens, and how its artifact encodes that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
    kind: TransportKind,
}

impl Endpoint {
    pub fn new(path: impl Into<PathBuf>, kind: TransportKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn from_config(config: &PortalConfig) -> Self {
        Self::new(config.endpoint.clone(), config.transport)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The coordination directory shared by all artifacts.
    pub fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    pub fn starting_lock_path(&self) -> PathBuf {
        self.directory().join(STARTING_LOCK_NAME)
    }

    pub fn stop_sentinel_path(&self) -> PathBuf {
        self.directory().join(STOP_SENTINEL_NAME)
    }

    pub async fn ensure_directory(&self) -> crate::Result<()> {
        tokio::fs::create_dir_all(self.directory()).await?;
        Ok(())
    }

    /// Whether a portal has published this endpoint.
    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Atomically publish a discovery value.
    ///
    /// The value is written to a private temp file and renamed over the endpoint,
    /// so readers see either no file or the complete value.
    pub async fn publish(&self, value: &str) -> crate::Result<()> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .directory()
            .join(format!(".{file_name}.{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, value).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read the loopback port from a TCP endpoint file.
    pub async fn read_port(&self) -> crate::Result<u16> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        content.trim().parse::<u16>().map_err(|e| {
            PortalError::Io(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("endpoint {} does not hold a port: {e}", self.path.display()),
            ))
        })
    }

    /// Remove the endpoint artifact; a missing file is not an error.
    pub async fn remove(&self) -> crate::Result<()> {
        remove_if_exists(&self.path).await
    }

    /// Try to become the one client that starts the portal.
    ///
    /// Returns `Ok(false)` when another caller already holds the lock.
    pub async fn try_acquire_starting_lock(&self) -> crate::Result<bool> {
        let result = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.starting_lock_path())
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn release_starting_lock(&self) -> crate::Result<()> {
        remove_if_exists(&self.starting_lock_path()).await
    }

    /// Ask the portal serving this endpoint to shut down.
    pub async fn request_stop(&self) -> crate::Result<()> {
        self.ensure_directory().await?;
        tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.stop_sentinel_path())
            .await?;
        Ok(())
    }

    pub async fn clear_stop_request(&self) -> crate::Result<()> {
        remove_if_exists(&self.stop_sentinel_path()).await
    }

    /// Guard that removes the endpoint artifact when dropped.
    ///
    /// `published` is the discovery value this instance wrote, if any. Without
    /// one the guard remembers the identity of the file now at the path (the
    /// bound socket). Either way, a file another portal has since put there is
    /// left alone.
    pub fn guard(&self, published: Option<&str>) -> EndpointGuard {
        let claim = match published {
            Some(value) => Claim::Value(value.to_string()),
            None => Claim::of_file(&self.path),
        };
        EndpointGuard {
            path: self.path.clone(),
            claim,
        }
    }
}

async fn remove_if_exists(path: &Path) -> crate::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// What a guard expects to find at the endpoint before removing it.
#[derive(Debug)]
enum Claim {
    Value(String),
    #[cfg(unix)]
    File { dev: u64, ino: u64 },
    Unchecked,
}

impl Claim {
    #[cfg(unix)]
    fn of_file(path: &Path) -> Self {
        use std::os::unix::fs::MetadataExt;
        match std::fs::symlink_metadata(path) {
            Ok(meta) => Claim::File {
                dev: meta.dev(),
                ino: meta.ino(),
            },
            Err(_) => Claim::Unchecked,
        }
    }

    #[cfg(not(unix))]
    fn of_file(_path: &Path) -> Self {
        Claim::Unchecked
    }

    fn holds(&self, path: &Path) -> bool {
        match self {
            Claim::Value(value) => std::fs::read_to_string(path)
                .map(|content| content.trim() == value)
                .unwrap_or(false),
            #[cfg(unix)]
            Claim::File { dev, ino } => {
                use std::os::unix::fs::MetadataExt;
                std::fs::symlink_metadata(path)
                    .map(|meta| meta.dev() == *dev && meta.ino() == *ino)
                    .unwrap_or(false)
            }
            Claim::Unchecked => true,
        }
    }
}

/// Removes a published endpoint on every exit path of the server, unwinding included.
pub struct EndpointGuard {
    path: PathBuf,
    claim: Claim,
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        if !self.claim.holds(&self.path) {
            tracing::debug!(
                endpoint = %self.path.display(),
                "endpoint now belongs to another portal, leaving it"
            );
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(endpoint = %self.path.display(), "endpoint removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                endpoint = %self.path.display(),
                error = %e,
                "failed to remove endpoint"
            ),
        }
    }
}
