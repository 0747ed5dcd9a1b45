// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS acceptor loading for switch connections.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// TLS-specific error type.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS configuration error: {0}")]
    Config(#[from] rustls::Error),
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("{}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TlsError::Certificate(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| TlsError::Certificate(format!("no private key found in {}", path.display())))
}

/// Build a server-side acceptor. Switches are not asked for client certificates.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TlsError::Io { .. }));
    }

    #[test]
    fn test_empty_pem_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        assert!(matches!(
            load_certs(file.path()),
            Err(TlsError::Certificate(_))
        ));
        assert!(matches!(
            load_private_key(file.path()),
            Err(TlsError::Certificate(_))
        ));
    }
}
