//! Trusted-CA pool: a `rustls::RootCertStore` built from system defaults
//! plus every active `CertificateAuthority` row, rebuilt on demand and
//! swapped in atomically. Grounded on the certificate-pinned
//! `reqwest::Client` factory pattern (custom `rustls::ClientConfig` over an
//! explicit `RootCertStore`), generalised from a fixed root set to a
//! DB-backed one that changes as operators add/revoke CAs.

mod parse;

pub use parse::{parse_ca_pem, ParsedCa};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct TrustSnapshot {
    pub root_store: Arc<rustls::RootCertStore>,
    pub built_at: DateTime<Utc>,
    pub active_ca_count: usize,
    pub skipped_count: usize,
}

pub struct CaPool {
    db: sqlx::PgPool,
    snapshot: ArcSwap<TrustSnapshot>,
}

impl CaPool {
    /// Build the pool with an initial snapshot (system roots only, no
    /// active CAs yet known) so `get_http_client` has something to use
    /// before the first `force_refresh` completes.
    pub fn new(db: sqlx::PgPool) -> Result<Self> {
        let system_roots = load_system_roots()?;
        let snapshot = TrustSnapshot {
            root_store: Arc::new(system_roots),
            built_at: Utc::now(),
            active_ca_count: 0,
            skipped_count: 0,
        };

        Ok(Self {
            db,
            snapshot: ArcSwap::new(Arc::new(snapshot)),
        })
    }

    pub fn current_snapshot(&self) -> Arc<TrustSnapshot> {
        self.snapshot.load_full()
    }

    /// Rebuild the trust store from the database and swap it in. A
    /// malformed or non-CA row is skipped and logged, never aborts the
    /// whole refresh — one bad upload must not take down TLS for every
    /// other instance (spec §4.2).
    pub async fn force_refresh(&self) -> Result<()> {
        let active = pacp_db::list_active_certificate_authorities(&self.db)
            .await
            .context("force_refresh: failed to list active certificate authorities")?;

        let mut root_store = load_system_roots()?;
        let mut accepted = 0usize;
        let mut skipped = 0usize;

        for ca in &active {
            match parse_ca_pem(&ca.pem) {
                Ok(parsed) => {
                    let mut added_any = false;
                    for (info, der) in parsed.chain_info.iter().zip(parsed.der_certs.into_iter()) {
                        let is_self_signed = info.subject == info.issuer;
                        if !(info.is_ca || is_self_signed) {
                            tracing::warn!(
                                ca_id = %ca.id,
                                subject = %info.subject,
                                "capool/non-ca-cert-skipped"
                            );
                            continue;
                        }
                        match root_store.add(der.into()) {
                            Ok(()) => added_any = true,
                            Err(e) => {
                                tracing::warn!(ca_id = %ca.id, error = %e, "capool/cert-rejected");
                            }
                        }
                    }
                    if added_any {
                        accepted += 1;
                    } else {
                        skipped += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(ca_id = %ca.id, error = %e, "capool/pem-unparseable");
                    skipped += 1;
                }
            }
        }

        let snapshot = TrustSnapshot {
            root_store: Arc::new(root_store),
            built_at: Utc::now(),
            active_ca_count: accepted,
            skipped_count: skipped,
        };

        tracing::info!(
            accepted,
            skipped,
            "capool/refreshed"
        );

        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    /// Build a `reqwest::Client` pinned to the current trust snapshot. When
    /// `skip_tls_verify` is set on the `UpstreamInstance` (an explicit,
    /// per-instance operator opt-out — never a global default), certificate
    /// validation is disabled entirely for that client instead.
    pub fn get_http_client(&self, skip_tls_verify: bool, timeout: Duration) -> Result<reqwest::Client> {
        if skip_tls_verify {
            return reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .connect_timeout(Duration::from_secs(10))
                .timeout(timeout)
                .build()
                .context("failed to build skip-tls-verify reqwest client");
        }

        let snapshot = self.current_snapshot();
        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("failed to set default TLS protocol versions")?
        .with_root_certificates((*snapshot.root_store).clone())
        .with_no_client_auth();

        reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .context("failed to build certificate-pinned reqwest client")
    }
}

fn load_system_roots() -> Result<rustls::RootCertStore> {
    let mut store = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!(error = %err, "capool/native-root-load-error");
    }
    for cert in native.certs {
        if let Err(e) = store.add(cert) {
            tracing::warn!(error = %e, "capool/native-root-rejected");
        }
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_system_roots_does_not_error() {
        load_system_roots().unwrap();
    }
}
