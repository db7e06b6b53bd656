use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::Deserialize;
use tokio_rustls::rustls::server::AllowAnyAuthenticatedClient;
use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Code, Error, Result};

/// Certificates for mutually authenticated TLS between terminals.
///
/// Every terminal presents `cert_path` and accepts peers whose certificate
/// chains to `ca_cert_path`. Certificates must name the terminal's IP address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_cert_path: PathBuf,
}

fn key_error(path: &Path, detail: impl std::fmt::Display) -> Error {
    Error::new(Code::Key, format!("{}: {detail}", path.display()))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| key_error(path, e))
}

impl TlsSettings {
    fn cert_chain(&self) -> Result<Vec<Certificate>> {
        let chain: Vec<Certificate> = certs(&mut open(&self.cert_path)?)
            .map_err(|e| key_error(&self.cert_path, e))?
            .into_iter()
            .map(Certificate)
            .collect();
        if chain.is_empty() {
            return Err(key_error(&self.cert_path, "no certificates found"));
        }
        Ok(chain)
    }

    fn private_key(&self) -> Result<PrivateKey> {
        let mut keys = pkcs8_private_keys(&mut open(&self.key_path)?)
            .map_err(|e| key_error(&self.key_path, e))?;
        if keys.is_empty() {
            return Err(key_error(&self.key_path, "no PKCS#8 private key found"));
        }
        Ok(PrivateKey(keys.remove(0)))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        for cert in certs(&mut open(&self.ca_cert_path)?).map_err(|e| key_error(&self.ca_cert_path, e))? {
            store
                .add(&Certificate(cert))
                .map_err(|e| key_error(&self.ca_cert_path, e))?;
        }
        Ok(store)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(
                self.root_store()?,
            )))
            .with_single_cert(self.cert_chain()?, self.private_key()?)
            .map_err(|e| key_error(&self.cert_path, e))?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    pub fn connector(&self) -> Result<TlsConnector> {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.cert_chain()?, self.private_key()?)
            .map_err(|e| key_error(&self.cert_path, e))?;
        Ok(TlsConnector::from(Arc::new(config)))
    }
}
