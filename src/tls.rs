use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::Config;

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg)
}

/// PEM certificate chain and private key named by the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsFiles<'a> {
    pub cert: &'a Path,
    pub key: &'a Path,
}

impl<'a> TlsFiles<'a> {
    /// `None` when TLS is off. Setting only one of the two paths is an error.
    pub fn from_config(config: &'a Config) -> io::Result<Option<Self>> {
        match (config.tls_cert.as_deref(), config.tls_key.as_deref()) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self {
                cert: Path::new(cert),
                key: Path::new(key),
            })),
            _ => Err(invalid(
                "both PARKD_TLS_CERT and PARKD_TLS_KEY must be set, or neither",
            )),
        }
    }

    fn certificates(&self) -> io::Result<Vec<CertificateDer<'static>>> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(self.cert)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(invalid("no certificates found in cert file"));
        }
        Ok(certs)
    }

    fn private_key(&self) -> io::Result<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut BufReader::new(File::open(self.key)?))?
            .ok_or_else(|| invalid("no private key found in key file"))
    }
}

/// Build the acceptor handed to every connection, or `None` for plaintext.
pub fn acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let Some(files) = TlsFiles::from_config(config)? else {
        return Ok(None);
    };
    let certs = files.certificates()?;
    let key = files.private_key()?;

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!(cert = %files.cert.display(), "TLS enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}
