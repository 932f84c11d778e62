//! PEM certificate bundle handling.

use crate::{Error, Result};
use pem::{EncodeConfig, LineEnding, Pem};

const CERTIFICATE: &str = "CERTIFICATE";

/// Concatenates certificate bundles, dropping byte-identical duplicates.
///
/// Every block is re-encoded in discovery order. Empty inputs are skipped; a
/// non-empty input without any parseable certificate is rejected.
pub fn merge_certificate_data<'b>(bundles: impl IntoIterator<Item = &'b [u8]>) -> Result<Vec<u8>> {
    let mut merged: Vec<Vec<u8>> = Vec::new();
    for bundle in bundles {
        if bundle.is_empty() {
            continue;
        }
        for der in parse_certificates(bundle)? {
            if !merged.contains(&der) {
                merged.push(der);
            }
        }
    }

    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    let mut out = Vec::new();
    for der in merged {
        out.extend_from_slice(pem::encode_config(&Pem::new(CERTIFICATE, der), config).as_bytes());
    }
    Ok(out)
}

/// Decodes every certificate block in a PEM bundle, validating each as X.509.
pub fn parse_certificates(bundle: &[u8]) -> Result<Vec<Vec<u8>>> {
    let blocks = pem::parse_many(bundle)
        .map_err(|error| Error::malformed(format!("invalid PEM data: {error}")))?;

    let mut certs = Vec::with_capacity(blocks.len());
    for block in blocks.into_iter().filter(|b| b.tag() == CERTIFICATE) {
        x509_parser::parse_x509_certificate(block.contents())
            .map_err(|error| Error::malformed(format!("invalid certificate: {error}")))?;
        certs.push(block.into_contents());
    }

    if certs.is_empty() {
        return Err(Error::malformed("data does not contain any valid certificate"));
    }
    Ok(certs)
}
