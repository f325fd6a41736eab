//! TLS identity: the certificate chain and private key the server presents.
//!
//! An [`Identity`] is validated once at load and never mutated. The
//! [`IdentityStore`] hands out `Arc` snapshots; rotation swaps the reference
//! so handshakes already in flight keep the identity they started with.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tracing::{debug, info, warn};

/// Common name used for generated certificates.
const GENERATED_COMMON_NAME: &str = "mentor";

/// Errors raised while loading or generating an identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("private key does not match the certificate's public key")]
    KeyCertMismatch,

    #[error("failed to generate certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Result type for identity operations
pub type IdentityResult<T> = Result<T, IdentityError>;

/// A validated certificate chain and private key, ready for handshakes.
pub struct Identity {
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    not_after: Option<DateTime<Utc>>,
    fingerprint: String,
    tls_config: Arc<ServerConfig>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificates", &self.certificate_chain.len())
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Load a PEM certificate chain and PEM private key from disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> IdentityResult<Self> {
        let cert_pem = fs::read(cert_path).map_err(|e| {
            IdentityError::InvalidCertificate(format!("cannot read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read(key_path).map_err(|e| {
            IdentityError::InvalidKey(format!("cannot read {}: {}", key_path.display(), e))
        })?;

        let identity = Self::from_pem(&cert_pem, &key_pem)?;
        info!(
            cert = %cert_path.display(),
            fingerprint = %identity.fingerprint,
            "Loaded TLS identity"
        );
        Ok(identity)
    }

    /// Build an identity from in-memory PEM data.
    ///
    /// Every certificate must parse; the leaf's public key must match the
    /// private key. An expired leaf only produces a warning.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> IdentityResult<Self> {
        let certificate_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<Result<_, _>>()
                .map_err(|e| IdentityError::InvalidCertificate(format!("malformed PEM: {}", e)))?;
        if certificate_chain.is_empty() {
            return Err(IdentityError::InvalidCertificate(
                "no certificates found".to_string(),
            ));
        }

        for (index, cert) in certificate_chain.iter().enumerate() {
            x509_parser::parse_x509_certificate(cert.as_ref()).map_err(|e| {
                IdentityError::InvalidCertificate(format!("certificate #{} does not parse: {}", index, e))
            })?;
        }
        let (_, leaf) = x509_parser::parse_x509_certificate(certificate_chain[0].as_ref())
            .map_err(|e| IdentityError::InvalidCertificate(e.to_string()))?;

        let validity = leaf.validity();
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0);
        if !validity.is_valid() {
            warn!(
                not_before = %validity.not_before,
                not_after = %validity.not_after,
                "TLS certificate is outside its validity period; serving it anyway"
            );
        }

        let private_key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| IdentityError::InvalidKey(format!("malformed PEM: {}", e)))?
            .ok_or_else(|| IdentityError::InvalidKey("no private key found".to_string()))?;

        let provider = Arc::new(ring::default_provider());
        let signing_key = provider
            .key_provider
            .load_private_key(private_key.clone_key())
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        if let Some(spki) = signing_key.public_key() {
            if spki.as_ref() != leaf.public_key().raw {
                return Err(IdentityError::KeyCertMismatch);
            }
        }

        let tls_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certificate_chain.clone(), private_key.clone_key())?;

        let fingerprint = fingerprint(&certificate_chain[0]);
        debug!(%fingerprint, chain = certificate_chain.len(), "Validated TLS identity");

        Ok(Self {
            certificate_chain,
            private_key,
            not_after,
            fingerprint,
            tls_config: Arc::new(tls_config),
        })
    }

    /// Load the identity at the given paths, generating a self-signed one
    /// there first if either file is missing.
    pub fn load_or_generate(
        cert_path: &Path,
        key_path: &Path,
        hostnames: &[String],
    ) -> IdentityResult<Self> {
        if !cert_path.exists() || !key_path.exists() {
            info!(cert = %cert_path.display(), "Generating self-signed TLS certificate");
            SelfSigned::generate(hostnames)?.write(cert_path, key_path)?;
        }
        Self::load(cert_path, key_path)
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certificate_chain
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.not_after
    }

    pub fn is_expired(&self) -> bool {
        self.not_after.is_some_and(|t| t < Utc::now())
    }

    /// SHA-256 of the leaf certificate, as colon-separated hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// rustls configuration built from this identity.
    pub fn tls_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.tls_config)
    }
}

fn fingerprint(cert: &CertificateDer<'_>) -> String {
    Sha256::digest(cert.as_ref())
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// A freshly generated self-signed certificate and key, in PEM form.
pub struct SelfSigned {
    pub cert_pem: String,
    pub key_pem: String,
}

impl SelfSigned {
    /// Generate an ECDSA P-256 certificate valid for `hostnames`.
    pub fn generate(hostnames: &[String]) -> IdentityResult<Self> {
        let names = if hostnames.is_empty() {
            vec!["localhost".to_string()]
        } else {
            hostnames.to_vec()
        };

        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(names)?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, GENERATED_COMMON_NAME);
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Write both files; the key is readable by the owner only.
    pub fn write(&self, cert_path: &Path, key_path: &Path) -> IdentityResult<()> {
        write_file(cert_path, self.cert_pem.as_bytes())?;
        write_file(key_path, self.key_pem.as_bytes())?;
        #[cfg(unix)]
        restrict_permissions(key_path)?;
        Ok(())
    }

    pub fn into_identity(self) -> IdentityResult<Identity> {
        Identity::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
    }
}

fn write_file(path: &Path, contents: &[u8]) -> IdentityResult<()> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)
    };
    write().map_err(|source| IdentityError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> IdentityResult<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        IdentityError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Shared holder of the current identity.
#[derive(Debug)]
pub struct IdentityStore {
    current: RwLock<Arc<Identity>>,
}

impl IdentityStore {
    pub fn new(identity: Identity) -> Self {
        Self {
            current: RwLock::new(Arc::new(identity)),
        }
    }

    /// Snapshot of the identity to use for one handshake.
    pub fn current(&self) -> Arc<Identity> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Install a new identity, returning the one it replaced.
    pub fn rotate(&self, identity: Identity) -> Arc<Identity> {
        let next = Arc::new(identity);
        info!(fingerprint = %next.fingerprint(), "Rotating TLS identity");
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, next)
    }

    /// Load a new identity from disk and rotate to it. The current identity
    /// stays in place if loading fails.
    pub fn reload(&self, cert_path: &Path, key_path: &Path) -> IdentityResult<()> {
        let identity = Identity::load(cert_path, key_path)?;
        self.rotate(identity);
        Ok(())
    }
}
