//! TLS client configuration shared by the socket and the heartbeat channel

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::path::Path;
use std::sync::Arc;

use crate::{CoreError, Result};

/// Optional PEM-encoded TLS material
///
/// Without a CA certificate the bundled web PKI roots are trusted. The client
/// certificate and key must be given together.
#[derive(Clone, Default)]
pub struct TlsCredentials {
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material
        f.debug_struct("TlsCredentials")
            .field("ca_cert", &self.ca_cert.is_some())
            .field("client_cert", &self.client_cert.is_some())
            .field("client_key", &self.client_key.is_some())
            .finish()
    }
}

impl TlsCredentials {
    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert = Some(pem);
        self
    }

    pub fn with_client_identity(mut self, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        self.client_cert = Some(cert_pem);
        self.client_key = Some(key_pem);
        self
    }

    /// Load credentials from PEM files
    pub fn from_files(
        ca_cert: Option<&Path>,
        client_cert: Option<&Path>,
        client_key: Option<&Path>,
    ) -> Result<Self> {
        let read = |path: Option<&Path>| -> Result<Option<Vec<u8>>> {
            path.map(std::fs::read).transpose().map_err(CoreError::from)
        };
        Ok(Self {
            ca_cert: read(ca_cert)?,
            client_cert: read(client_cert)?,
            client_key: read(client_key)?,
        })
    }

    /// Build the rustls client configuration
    ///
    /// Uses the ring provider explicitly so no process-wide default provider
    /// is required.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        match &self.ca_cert {
            Some(pem) => {
                for cert in CertificateDer::pem_slice_iter(pem) {
                    let cert = cert.map_err(|e| CoreError::CertParseError(e.to_string()))?;
                    roots.add(cert)?;
                }
                if roots.is_empty() {
                    return Err(CoreError::CertParseError(
                        "CA bundle contains no certificates".to_string(),
                    ));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);

        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert_pem), Some(key_pem)) => {
                let chain = CertificateDer::pem_slice_iter(cert_pem)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| CoreError::CertParseError(e.to_string()))?;
                if chain.is_empty() {
                    return Err(CoreError::CertParseError(
                        "client certificate file contains no certificates".to_string(),
                    ));
                }
                let key = PrivateKeyDer::from_pem_slice(key_pem)
                    .map_err(|e| CoreError::CertParseError(e.to_string()))?;
                builder.with_client_auth_cert(chain, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(CoreError::Tls(
                    "client certificate and client key must be provided together".to_string(),
                ))
            }
        };

        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (Vec<u8>, Vec<u8>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (
            certified.cert.pem().into_bytes(),
            certified.key_pair.serialize_pem().into_bytes(),
        )
    }

    #[test]
    fn test_default_credentials_use_web_roots() {
        let config = TlsCredentials::default().client_config();
        assert!(config.is_ok());
    }

    #[test]
    fn test_custom_ca_and_client_identity() {
        let (ca, _) = self_signed();
        let (cert, key) = self_signed();
        let creds = TlsCredentials::default()
            .with_ca_cert(ca)
            .with_client_identity(cert, key);
        assert!(creds.client_config().is_ok());
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        let creds = TlsCredentials::default().with_ca_cert(b"not a certificate".to_vec());
        assert!(matches!(
            creds.client_config(),
            Err(CoreError::CertParseError(_))
        ));
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let (cert, _) = self_signed();
        let creds = TlsCredentials {
            client_cert: Some(cert),
            ..Default::default()
        };
        assert!(matches!(creds.client_config(), Err(CoreError::Tls(_))));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let (cert, key) = self_signed();
        let creds = TlsCredentials::default().with_client_identity(cert, key);
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("PRIVATE KEY"));
        assert!(rendered.contains("client_key: true"));
    }
}
