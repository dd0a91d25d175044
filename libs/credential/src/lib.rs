//! # credential
//!
//! Ephemeral self-signed identity for the benchmark server. A new key pair and
//! certificate are made on every call, nothing is written to disk and nothing
//! is ever rotated or revoked.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// common name placed in both subject and issuer
pub const COMMON_NAME: &str = "qbench";
/// name always present in the subject alt names
pub const DEFAULT_SAN: &str = "localhost";

/// certificate generation errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// rcgen could not build the key pair or sign the certificate
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

/// Result alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// A self-signed certificate and the private key it is bound to
#[derive(Debug)]
pub struct Credential {
    cert: CertificateDer<'static>,
    key: PrivatePkcs8KeyDer<'static>,
}

impl Credential {
    /// the DER encoded certificate
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    /// chain to hand to a TLS server config, it only ever has one entry
    pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert.clone()]
    }

    /// a copy of the private key
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key.clone_key())
    }
}

/// Generate a credential valid for `localhost`
pub fn generate() -> Result<Credential> {
    generate_for(Vec::<String>::new())
}

/// Generate a credential valid for `localhost` and every name in `names`
pub fn generate_for<I, S>(names: I) -> Result<Credential>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut sans = vec![DEFAULT_SAN.to_owned()];
    for name in names {
        let name = name.into();
        if !sans.contains(&name) {
            sans.push(name);
        }
    }

    let mut params = CertificateParams::new(sans.clone())?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    // a little slack either side so clock skew between peers doesn't matter
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(365);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    debug!(?sans, "generated self-signed certificate");

    Ok(Credential {
        cert: cert.der().clone(),
        key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    })
}
