//! PEM/X.509 parsing for uploaded certificate authorities.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use pacp_schemas::ChainCertInfo;
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

pub struct ParsedCa {
    pub fingerprint: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_root: bool,
    pub is_intermediate: bool,
    pub chain_info: Vec<ChainCertInfo>,
    pub der_certs: Vec<Vec<u8>>,
}

/// Parse an uploaded PEM blob, which may contain a leaf certificate followed
/// by zero or more intermediate/root certificates (spec §4.2's "chain" input).
/// The first certificate in the PEM is the primary one; its fingerprint and
/// metadata describe the `CertificateAuthority` row, while `chain_info`
/// describes every certificate found, in file order.
pub fn parse_ca_pem(pem: &str) -> Result<ParsedCa> {
    let ders = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse PEM blocks")?;

    if ders.is_empty() {
        return Err(anyhow!("no certificates found in PEM"));
    }

    let mut chain_info = Vec::with_capacity(ders.len());
    let mut der_certs = Vec::with_capacity(ders.len());
    let mut primary: Option<(String, String, DateTime<Utc>, DateTime<Utc>, bool, bool)> = None;

    for der in &ders {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| anyhow!("failed to parse certificate DER: {e}"))?;

        let subject = cert.subject().to_string();
        let issuer = cert.issuer().to_string();
        let not_before = asn1_time_to_chrono(cert.validity().not_before)?;
        let not_after = asn1_time_to_chrono(cert.validity().not_after)?;
        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);
        let is_self_signed = subject == issuer;

        chain_info.push(ChainCertInfo {
            subject: subject.clone(),
            issuer: issuer.clone(),
            not_before,
            not_after,
            is_ca,
        });
        der_certs.push(der.to_vec());

        if primary.is_none() {
            primary = Some((subject, issuer, not_before, not_after, is_self_signed, is_ca));
        }
    }

    let (subject, issuer, not_before, not_after, is_root, is_ca) =
        primary.expect("checked non-empty above");

    let mut hasher = Sha256::new();
    hasher.update(&der_certs[0]);
    let fingerprint = hex::encode(hasher.finalize());

    Ok(ParsedCa {
        fingerprint,
        subject,
        issuer,
        not_before,
        not_after,
        is_root,
        is_intermediate: is_ca && !is_root,
        chain_info,
        der_certs,
    })
}

fn asn1_time_to_chrono(t: x509_parser::time::ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(t.timestamp(), 0)
        .ok_or_else(|| anyhow!("certificate timestamp out of range: {}", t.timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // A short-lived self-signed test certificate (RSA-2048, CN=pacp-test-root),
    // generated once for this test and not used anywhere outside it.
    const TEST_ROOT_PEM: &str = include_str!("../tests/fixtures/test_root.pem");

    #[test]
    fn parses_self_signed_root_as_is_root() {
        let parsed = parse_ca_pem(TEST_ROOT_PEM).unwrap();
        assert!(parsed.is_root);
        assert!(!parsed.is_intermediate);
        assert_eq!(parsed.chain_info.len(), 1);
    }

    #[test]
    fn rejects_empty_pem() {
        assert!(parse_ca_pem("not a certificate").is_err());
    }
}
