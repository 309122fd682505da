//! TLS configuration and certificate loading.
//!
//! Client side: [`TlsContext`] is the trust configuration used for one
//! upstream call. The default context trusts the bundled webpki roots; a
//! resolver may hand out its own context (for example a device with a
//! self-signed certificate).
//!
//! Server side: the reference host can terminate TLS on its listener.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

/// Errors raised while building TLS contexts.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no usable certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Client-side trust configuration for upstream connections.
///
/// Cheap to clone; clones share the same underlying rustls configuration.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    /// Trust the bundled Mozilla root set.
    pub fn platform_default() -> Result<Self, TlsError> {
        Self::from_roots(default_roots())
    }

    /// Trust the bundled roots plus every certificate in a PEM bundle.
    pub fn with_ca_bundle(path: &Path) -> Result<Self, TlsError> {
        let mut roots = default_roots();
        add_pem_bundle(&mut roots, path)?;
        Self::from_roots(roots)
    }

    /// Trust exactly the given root store.
    pub fn from_roots(roots: RootCertStore) -> Result<Self, TlsError> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Self::from_client_config(config))
    }

    /// Wrap an already-built rustls configuration.
    pub fn from_client_config(config: ClientConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn client_config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Identity of the underlying configuration, stable while any clone lives.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.config) as usize
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("id", &format_args!("{:#x}", self.id()))
            .finish_non_exhaustive()
    }
}

fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

fn add_pem_bundle(roots: &mut RootCertStore, path: &Path) -> Result<(), TlsError> {
    let io_err = |source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;

    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(path = %path.display(), ignored, "Skipped unparsable certificates");
    }
    if added == 0 {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    tracing::debug!(path = %path.display(), added, "Loaded CA bundle");
    Ok(())
}

/// Load the listener certificate and key.
pub async fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_context_builds() {
        let ctx = TlsContext::platform_default().unwrap();
        assert!(ctx.client_config().alpn_protocols.is_empty());
    }

    #[test]
    fn clones_share_identity() {
        let a = TlsContext::platform_default().unwrap();
        let b = a.clone();
        let c = TlsContext::platform_default().unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn missing_bundle_is_io_error() {
        let err = TlsContext::with_ca_bundle(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn bundle_without_certificates_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = TlsContext::with_ca_bundle(file.path()).unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates(_)));
    }

    #[tokio::test]
    async fn server_config_requires_files() {
        let err = load_server_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
