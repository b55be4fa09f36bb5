//! tls session setup honoring the `ssl_*` configuration options.

use std::{fs, io, sync::Arc};

use sha2::{Digest, Sha256};
use xitca_io::io::AsyncIo;
use xitca_tls::rustls::{
    self, ClientConfig, ClientConnection, RootCertStore, TlsStream,
    client::WebPkiServerVerifier,
    pki_types::{CertificateDer, CertificateRevocationListDer, ServerName},
};

use crate::{
    config::Config,
    error::{Error, InvalidState},
};

/// upgrades `io` to a tls session against `host`.
///
/// on success also yields the tls-server-end-point channel binding data of the
/// server certificate for SCRAM-SHA-256-PLUS.
pub(crate) async fn connect_tls<Io>(
    io: Io,
    host: &str,
    cfg: &Config,
) -> Result<(TlsStream<ClientConnection, Io>, Option<Vec<u8>>), Error>
where
    Io: AsyncIo,
{
    let name = ServerName::try_from(host)
        .map_err(|_| InvalidState("host is not a valid tls server name"))?
        .to_owned();

    let session = ClientConnection::new(client_config(cfg)?, name).map_err(boxed)?;

    let stream = TlsStream::handshake(io, session).await?;

    let end_point = stream
        .session()
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| Sha256::digest(cert.as_ref()).to_vec());

    Ok((stream, end_point))
}

fn client_config(cfg: &Config) -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = cfg.get_ssl_root_cert() {
        for cert in rustls_pemfile::certs(&mut pem_reader(path)?) {
            roots.add(cert?).map_err(boxed)?;
        }
    }

    let builder = if cfg.get_ssl_hostname_verification() {
        let mut verifier = WebPkiServerVerifier::builder(Arc::new(roots));
        if let Some(path) = cfg.get_ssl_crl() {
            let crls = rustls_pemfile::crls(&mut pem_reader(path)?)
                .collect::<io::Result<Vec<CertificateRevocationListDer<'static>>>>()?;
            verifier = verifier.with_crls(crls);
        }
        let verifier = verifier.build().map_err(boxed)?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
    } else {
        // encryption without server authentication, as asked for.
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
    };

    let config = match (cfg.get_ssl_cert(), cfg.get_ssl_key()) {
        (Some(cert), Some(key)) => {
            let certs = rustls_pemfile::certs(&mut pem_reader(cert)?)
                .collect::<io::Result<Vec<CertificateDer<'static>>>>()?;
            let key = rustls_pemfile::private_key(&mut pem_reader(key)?)?
                .ok_or(InvalidState("no private key found in ssl key file"))?;
            builder.with_client_auth_cert(certs, key).map_err(boxed)?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

fn pem_reader(path: &std::path::Path) -> Result<io::BufReader<fs::File>, Error> {
    Ok(io::BufReader::new(fs::File::open(path)?))
}

#[cold]
#[inline(never)]
fn boxed(e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::from(Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
}

#[derive(Debug)]
struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
