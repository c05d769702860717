//! Client-side TLS setup. A `TlsConfig` is built once per cluster and
//! shared by every key-value and HTTP connection it opens.
//!
//! ## Why
//! Both session types need the same `rustls::ClientConfig` and the same
//! connect-then-handshake dance; centralizing it here keeps
//! `kv::session` and `http::session` symmetrical instead of each owning
//! a slightly different copy of the rustls plumbing.
//!
//! ## How
//! A `RootCertStore` is built from either the platform's webpki-style
//! trust (none shipped here — the cluster administrator supplies a PEM
//! bundle) or a PEM file named by `trust_certificate_path`. PEM
//! certificate blocks are decoded by hand: `base64` is already a
//! dependency for SCRAM, and pulling in a dedicated PEM crate just to
//! strip `-----BEGIN CERTIFICATE-----` markers would be a second way to
//! do the same job.
//!
//! ## What
//! `connect` takes an already-open `TcpStream` and a hostname, runs the
//! TLS handshake, and returns a boxed stream so callers don't need to
//! know whether the connection ended up encrypted.
//!
//! ## Trade-offs
//! No client-certificate (mutual TLS) support; the server clusters this
//! client targets only require server-certificate verification.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use fathom_core::config::ClusterOptions;

use crate::stream::BoxedStream;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read trust certificate bundle at {path}: {source}")]
    ReadTrustBundle {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no PEM certificate blocks found in {0}")]
    EmptyTrustBundle(String),
    #[error("malformed PEM certificate block: {0}")]
    MalformedPem(String),
    #[error("failed to add certificate to trust store: {0}")]
    InvalidCertificate(String),
    #[error("invalid hostname for TLS server name indication: {0}")]
    InvalidServerName(String),
    #[error("tls handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

/// The TLS settings for one cluster: a root store plus the connector
/// built from it. Cheap to clone and share across every session.
#[derive(Clone)]
pub struct TlsConfig {
    connector: TlsConnector,
}

impl TlsConfig {
    /// An empty trust store, useful only for tests that don't actually
    /// perform a handshake against a real server.
    pub fn empty_trust_store() -> Result<Self, TlsConfigError> {
        Self::from_root_store(RootCertStore::empty())
    }

    /// Build a trust store from a PEM bundle on disk.
    pub fn from_trust_pem(path: &str) -> Result<Self, TlsConfigError> {
        let pem = std::fs::read_to_string(path).map_err(|source| TlsConfigError::ReadTrustBundle {
            path: path.to_string(),
            source,
        })?;
        let certs = parse_pem_certificates(&pem)?;
        if certs.is_empty() {
            return Err(TlsConfigError::EmptyTrustBundle(path.to_string()));
        }

        let mut store = RootCertStore::empty();
        for cert in certs {
            store
                .add(cert)
                .map_err(|e| TlsConfigError::InvalidCertificate(e.to_string()))?;
        }
        Self::from_root_store(store)
    }

    /// `Some(config)` when `options.tls` is set, built from
    /// `trust_certificate_path` if one was given, otherwise from an
    /// empty store that trusts nothing by default.
    pub fn from_cluster_options(options: &ClusterOptions) -> Result<Option<Self>, TlsConfigError> {
        if !options.tls {
            return Ok(None);
        }
        let config = match &options.trust_certificate_path {
            Some(path) => Self::from_trust_pem(path)?,
            None => Self::empty_trust_store()?,
        };
        Ok(Some(config))
    }

    fn from_root_store(store: RootCertStore) -> Result<Self, TlsConfigError> {
        let client_config = ClientConfig::builder()
            .with_root_certificates(store)
            .with_no_client_auth();
        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Run the client handshake over an already-connected TCP socket,
    /// verifying the peer certificate against `hostname`.
    pub async fn connect(&self, stream: TcpStream, hostname: &str) -> Result<BoxedStream, TlsConfigError> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TlsConfigError::InvalidServerName(hostname.to_string()))?;
        let stream = self.connector.connect(server_name, stream).await?;
        Ok(Box::new(stream))
    }
}

/// Decode every `-----BEGIN CERTIFICATE----- ... -----END CERTIFICATE-----`
/// block in `pem` into DER bytes.
fn parse_pem_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let mut certs = Vec::new();
    let mut rest = pem;
    while let Some(begin_at) = rest.find(BEGIN) {
        let after_begin = &rest[begin_at + BEGIN.len()..];
        let end_at = after_begin
            .find(END)
            .ok_or_else(|| TlsConfigError::MalformedPem("unterminated certificate block".to_string()))?;
        let body: String = after_begin[..end_at].chars().filter(|c| !c.is_whitespace()).collect();
        let der = STANDARD
            .decode(body)
            .map_err(|e| TlsConfigError::MalformedPem(e.to_string()))?;
        certs.push(CertificateDer::from(der));
        rest = &after_begin[end_at + END.len()..];
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_certificates() {
        assert!(parse_pem_certificates("").unwrap().is_empty());
    }

    #[test]
    fn unterminated_block_is_a_malformed_pem_error() {
        let err = parse_pem_certificates("-----BEGIN CERTIFICATE-----\nMII=\n").unwrap_err();
        assert!(matches!(err, TlsConfigError::MalformedPem(_)));
    }

    #[test]
    fn trust_store_with_no_certificates_still_builds_a_connector() {
        assert!(TlsConfig::empty_trust_store().is_ok());
    }
}
