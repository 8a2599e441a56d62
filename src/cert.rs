//! Ephemeral certificate generation
//!
//! The proxy deliberately presents an untrusted, self-signed certificate to
//! every CONNECT tunnel: a client that completes the handshake anyway is
//! the audit finding. Certificates are generated fresh per accepted
//! connection and never cached or persisted.

use crate::error::{Error, Result};
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Common name baked into every generated certificate.
pub const AUDIT_COMMON_NAME: &str = "wpad-audit";

/// Validity window: two years, long enough to rule out expiry as the
/// reason a client rejects the handshake.
const VALIDITY_DAYS: i64 = 730;

/// A freshly generated self-signed certificate and its private key, owned
/// by exactly one connection handler and discarded with it.
pub struct EphemeralCertificate {
  cert_der: CertificateDer<'static>,
  key_der: PrivateKeyDer<'static>,
}

impl EphemeralCertificate {
  /// Generate a self-signed certificate bound to [`AUDIT_COMMON_NAME`].
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, AUDIT_COMMON_NAME);
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("Failed to self-sign certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("Failed to serialize private key"))?;

    Ok(Self { cert_der, key_der })
  }

  /// Build a TLS acceptor presenting this certificate.
  pub fn into_acceptor(self) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(vec![self.cert_der], self.key_der)
      .map_err(|e| Error::tls(format!("Failed to create TLS config: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
  }

  /// DER bytes of the certificate, for inspection.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
}
