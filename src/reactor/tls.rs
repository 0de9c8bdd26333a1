//! TLS client configuration shared by all connections.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::ErrorKind;

/// Build the one `ClientConfig` every TLS connection shares.
///
/// Verification uses the bundled webpki roots; `accept_invalid_certs`
/// swaps in a verifier that still checks handshake signatures but
/// accepts any certificate chain.
pub(crate) fn client_config(accept_invalid_certs: bool) -> Arc<ClientConfig> {
    let mut config = if accept_invalid_certs {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Turn a host name into the `ServerName` rustls expects for SNI.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, ErrorKind> {
    ServerName::try_from(host.to_string()).map_err(|_| {
        ErrorKind::Tls(rustls::Error::General(format!(
            "invalid server name `{host}`"
        )))
    })
}

/// Verifier that accepts any certificate chain but still validates the
/// handshake signatures, so a garbled peer fails loudly rather than
/// silently.
#[derive(Debug)]
struct AcceptAnyCert(WebPkiSupportedAlgorithms);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(
            rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}
