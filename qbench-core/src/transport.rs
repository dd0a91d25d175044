//! # Transport
//!
//! Builds the quinn endpoints and TLS configs both roles run on. Everything
//! below the `Endpoint`/`Connection` API (handshake, congestion control, flow
//! control) belongs to quinn.
use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use credential::Credential;
use quinn::{
    ClientConfig, Endpoint, ServerConfig, TransportConfig, VarInt,
    crypto::rustls::{QuicClientConfig, QuicServerConfig},
};
use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, CryptoProvider},
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// ALPN id both sides must agree on
pub const ALPN: &[u8] = b"qbench";
pub use crate::config::cli::DEFAULT_MAX_STREAMS;

/// How the client checks the server's certificate. There is no `Default`,
/// callers pick one.
#[derive(Debug, Clone)]
pub enum VerifyPolicy {
    /// accept any certificate, for benchmarking against a throwaway server
    Insecure,
    /// verify against these roots
    Trust(Vec<CertificateDer<'static>>),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::ring::default_provider())
}

fn transport(max_streams: u32) -> Arc<TransportConfig> {
    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(max_streams));
    Arc::new(transport)
}

/// quinn server config presenting `cred`
pub fn server_config(cred: &Credential, max_streams: u32) -> Result<ServerConfig> {
    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| Error::Tls(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(cred.cert_chain(), cred.private_key())
        .map_err(|err| Error::Tls(err.to_string()))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(tls).map_err(|err| Error::Tls(err.to_string()))?;
    let mut config = ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport(max_streams));
    Ok(config)
}

/// quinn client config verifying the server per `policy`
pub fn client_config(policy: &VerifyPolicy) -> Result<ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| Error::Tls(err.to_string()))?;

    let mut tls = match policy {
        VerifyPolicy::Insecure => {
            warn!("server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        }
        VerifyPolicy::Trust(certs) => {
            let mut roots = RootCertStore::empty();
            for cert in certs {
                roots
                    .add(cert.clone())
                    .map_err(|err| Error::Tls(err.to_string()))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls).map_err(|err| Error::Tls(err.to_string()))?;
    let mut config = ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport(DEFAULT_MAX_STREAMS));
    Ok(config)
}

/// Bind a server endpoint on `addr`
pub fn server_endpoint(addr: SocketAddr, config: ServerConfig) -> Result<Endpoint> {
    debug!(?addr, "binding QUIC endpoint");
    Endpoint::server(config, addr).map_err(|source| Error::Bind { addr, source })
}

/// Bind an ephemeral client endpoint in the same family as `peer`
pub fn client_endpoint(peer: SocketAddr) -> Result<Endpoint> {
    let addr = if peer.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    Endpoint::client(addr).map_err(|source| Error::Bind { addr, source })
}

/// Resolve `host:port` to the first address it yields
pub async fn resolve(addr: &str) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|err| Error::Resolve {
            addr: addr.to_owned(),
            reason: err.to_string(),
        })?;
    addrs.next().ok_or_else(|| Error::Resolve {
        addr: addr.to_owned(),
        reason: "no addresses returned".to_owned(),
    })
}

/// Accepts any server certificate. Handshake signatures are still checked,
/// so the peer must hold the key for whatever certificate it sends.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configs_build() {
        let cred = credential::generate().unwrap();
        server_config(&cred, DEFAULT_MAX_STREAMS).unwrap();
        client_config(&VerifyPolicy::Insecure).unwrap();
        client_config(&VerifyPolicy::Trust(cred.cert_chain())).unwrap();
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let addr = resolve("localhost:6666").await.unwrap();
        assert_eq!(addr.port(), 6666);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn unresolvable_is_startup_error() {
        let err = resolve("not a host").await.unwrap_err();
        assert_eq!(err.scope(), crate::Scope::Startup);
    }

    #[tokio::test]
    async fn bind_conflict_is_startup_error() {
        let cred = credential::generate().unwrap();
        let first = server_endpoint(
            "127.0.0.1:0".parse().unwrap(),
            server_config(&cred, DEFAULT_MAX_STREAMS).unwrap(),
        )
        .unwrap();
        let taken = first.local_addr().unwrap();

        let err = server_endpoint(taken, server_config(&cred, DEFAULT_MAX_STREAMS).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(err.scope(), crate::Scope::Startup);
    }
}
