use std::{fs::File, io::BufReader, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig,
    DigitallySignedStruct,
    RootCertStore,
    SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    client::options::TlsOptions,
    error::{Error, ErrorKind, Result},
};

pub(crate) type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Configuration required to use TLS. Creating this is expensive, so its best to cache this value
/// and reuse it for multiple connections.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options from the user.
    /// This operation is expensive, so the resultant `TlsConfig` should be cached.
    pub(crate) fn new(options: &TlsOptions) -> Result<TlsConfig> {
        let config = Arc::new(make_rustls_config(options)?);
        Ok(TlsConfig {
            connector: TlsConnector::from(config.clone()),
            config,
        })
    }

    /// The underlying rustls configuration, used to configure HTTP clients.
    pub(crate) fn rustls_config(&self) -> ClientConfig {
        self.config.as_ref().clone()
    }

    pub(crate) async fn connect(&self, host: &str, tcp_stream: TcpStream) -> Result<TlsStream> {
        let name = ServerName::try_from(host.to_string()).map_err(|e| ErrorKind::InvalidTlsConfig {
            message: format!("could not resolve {host:?}: {e}"),
        })?;

        Ok(self.connector.connect(name, tcp_stream).await?)
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn invalid_pem(what: &str, path: &std::path::Path) -> Error {
    ErrorKind::InvalidTlsConfig {
        message: format!("Unable to parse PEM-encoded {what} from {}", path.display()),
    }
    .into()
}

/// Converts `TlsOptions` into a rustls::ClientConfig.
fn make_rustls_config(cfg: &TlsOptions) -> Result<ClientConfig> {
    use rustls::pki_types::pem::PemObject;

    let mut store = RootCertStore::empty();
    if let Some(path) = cfg.ca_file_path.as_ref() {
        let certs = CertificateDer::pem_reader_iter(BufReader::new(File::open(path)?))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid_pem("root certificate", path))?;
        store.add_parsable_certificates(certs);
    } else {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(store);

    let mut config = if let Some(path) = cfg.cert_key_file_path.as_ref() {
        let certs = CertificateDer::pem_reader_iter(BufReader::new(File::open(path)?))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid_pem("client certificate", path))?;
        let key = PrivateKeyDer::from_pem_reader(BufReader::new(File::open(path)?))
            .map_err(|_| invalid_pem("private key", path))?;
        builder.with_client_auth_cert(certs, key)?
    } else {
        builder.with_no_client_auth()
    };

    if let Some(true) = cfg.allow_invalid_certificates {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier(crypto_provider())));
    }

    Ok(config)
}

#[derive(Debug)]
struct NoCertVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
