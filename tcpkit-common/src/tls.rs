//! # TLS Configuration
//!
//! Purpose: Build rustls client and server configs from PEM files on disk,
//! and derive TLS server names from dial addresses.
//!
//! ## Design Principles
//! 1. **Explicit Provider**: Configs are built against the aws-lc-rs provider
//!    directly, so nothing depends on a process-wide default being installed.
//! 2. **Errors Surface**: Unreadable or empty PEM files are reported, never
//!    replaced by an empty config.

use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{CryptoProvider, aws_lc_rs};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::error::{NetError, NetResult};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// Reads every certificate in a PEM file.
pub fn load_certs(path: impl AsRef<Path>) -> NetResult<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let certs = CertificateDer::pem_file_iter(path)?.collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(NetError::InvalidCertificate(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Reads the first private key in a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> NetResult<PrivateKeyDer<'static>> {
    Ok(PrivateKeyDer::from_pem_file(path.as_ref())?)
}

/// Server config presenting the certificate chain in `crt_file`.
pub fn load_server_config(
    crt_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> NetResult<Arc<ServerConfig>> {
    let certs = load_certs(crt_file)?;
    let key = load_private_key(key_file)?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Client config that trusts the certificates in `crt_file` and offers them
/// with `key_file` as its client identity.
pub fn load_client_config(
    crt_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> NetResult<Arc<ClientConfig>> {
    let certs = load_certs(crt_file)?;
    let mut roots = RootCertStore::empty();
    for cert in &certs {
        roots.add(cert.clone())?;
    }
    let key = load_private_key(key_file)?;
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Server name for the host part of `addr` (`host:port`, `[v6]:port` or a
/// bare host).
pub fn server_name(addr: &str) -> NetResult<ServerName<'static>> {
    ServerName::try_from(host_of(addr).to_string())
        .map_err(|_| NetError::InvalidAddress(addr.to_string()))
}

fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match addr.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}
