use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    sync::Arc,
};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::error::TlsError;

/// Builds the acceptor used to terminate `wss://` on the server listener.
pub fn load_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let cert_chain: Vec<_> = read_pem(&tls.cert_file, |reader| certs(reader).collect())?;
    if cert_chain.is_empty() {
        return Err(TlsError::NoCertificates(tls.cert_file.clone()));
    }

    let key = read_pem(&tls.key_file, private_key)?
        .ok_or_else(|| TlsError::NoPrivateKey(tls.key_file.clone()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_pem<T>(
    path: &str,
    parse: impl FnOnce(&mut dyn BufRead) -> io::Result<T>,
) -> Result<T, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Open {
        path: path.to_string(),
        source,
    })?;
    parse(&mut BufReader::new(file)).map_err(|source| TlsError::Pem {
        path: path.to_string(),
        source,
    })
}
