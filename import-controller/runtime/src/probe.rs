//! Dials the hub API server to learn whether its serving certificate chains
//! to a publicly trusted root.

use crate::core::{Error, Result};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use std::{io, sync::Arc};
use tokio::{net::TcpStream, time};
use tokio_rustls::TlsConnector;
use tracing::debug;

const DIAL_TIMEOUT: time::Duration = time::Duration::from_secs(10);

pub(crate) async fn trusted_certificates(server_url: &str) -> Result<Vec<Vec<u8>>> {
    let (host, port) = endpoint(server_url)?;
    let name = ServerName::try_from(host.clone())
        .map_err(|error| Error::malformed(format!("invalid server name {host}: {error}")))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|error| Error::Remote(error.into()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let tcp = time::timeout(DIAL_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| Error::Remote(anyhow::anyhow!("timed out dialing {host}:{port}")))?
        .map_err(|error| Error::Remote(error.into()))?;

    match TlsConnector::from(Arc::new(config)).connect(name, tcp).await {
        Ok(stream) => {
            let (_, session) = stream.get_ref();
            Ok(session
                .peer_certificates()
                .unwrap_or_default()
                .iter()
                .map(|c| c.as_ref().to_vec())
                .collect())
        }
        Err(error) if is_untrusted(&error) => {
            debug!(%server_url, %error, "Server certificate is not publicly trusted");
            Ok(Vec::new())
        }
        Err(error) => Err(Error::Remote(error.into())),
    }
}

fn endpoint(server_url: &str) -> Result<(String, u16)> {
    let uri = server_url
        .parse::<http::Uri>()
        .map_err(|error| Error::malformed(format!("invalid server URL {server_url}: {error}")))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::malformed(format!("server URL {server_url} has no host")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, uri.port_u16().unwrap_or(443)))
}

fn is_untrusted(error: &io::Error) -> bool {
    error
        .get_ref()
        .and_then(|e| e.downcast_ref::<rustls::Error>())
        .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
}
