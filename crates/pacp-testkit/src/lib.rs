//! Shared test fixtures for the control plane's integration tests.
//!
//! Grounded on the ad hoc `FakeVault`/`CountingClient` doubles duplicated in
//! `pacp-sync` and `pacp-session`'s own test modules: one configurable
//! `VaultClient` fake, plus the `PACP_DATABASE_URL`-gated pool helper every
//! DB-backed scenario test repeats, consolidated the way `mqk-testkit`
//! centralises its orchestrator and fake broker for reuse across crates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use sqlx::PgPool;

use pacp_vault::{
    Page, VaultClient, VaultError, VendorGroupMembership, VendorSafe, VendorSafeAuthorization,
    VendorUser,
};

/// Connect and migrate against `PACP_DATABASE_URL`, or return `None` if it
/// isn't set — every DB-backed scenario test starts with
/// `let Some(pool) = pacp_testkit::ephemeral_pool().await? else { return Ok(()) };`.
pub async fn ephemeral_pool() -> anyhow::Result<Option<PgPool>> {
    let url = match std::env::var(pacp_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let pool = pacp_db::connect(&url).await?;
    pacp_db::migrate(&pool).await?;
    Ok(Some(pool))
}

fn vendor_user(id: &str, username: &str) -> VendorUser {
    VendorUser {
        id: id.to_string(),
        username: username.to_string(),
        user_type: "EPVUser".to_string(),
        suspended: false,
        enable_user: true,
        first_name: None,
        last_name: None,
        email: None,
        location: None,
        last_login: None,
        expiry: None,
    }
}

/// Convenience constructor matching the vendor's default field shape;
/// tests override individual fields with struct-update syntax.
pub fn fake_user(id: &str, username: &str) -> VendorUser {
    vendor_user(id, username)
}

fn paginate<T: Clone>(items: &[T], offset: u64, page_size: u64) -> Page<T> {
    let start = offset.saturating_sub(1) as usize;
    if start >= items.len() {
        return Page { value: vec![], has_more: false };
    }
    let end = (start + page_size as usize).min(items.len());
    Page { value: items[start..end].to_vec(), has_more: end < items.len() }
}

/// A configurable `VaultClient` double serving fixed pages of users,
/// group memberships, safes, and per-safe authorizations, with optional
/// auth-failure injection for exercising the Session Cache's recovery path
/// (spec §4.3's "recover from auth failure" flow).
#[derive(Default)]
pub struct FakeVaultClient {
    pub users: Vec<VendorUser>,
    pub group_memberships: Vec<VendorGroupMembership>,
    pub safes: Vec<VendorSafe>,
    pub safe_members: HashMap<String, Vec<VendorSafeAuthorization>>,
    pub auth_calls: AtomicU32,
    pub fail_next_auth: AtomicBool,
}

impl FakeVaultClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(mut self, users: Vec<VendorUser>) -> Self {
        self.users = users;
        self
    }

    pub fn with_group_memberships(mut self, memberships: Vec<VendorGroupMembership>) -> Self {
        self.group_memberships = memberships;
        self
    }

    pub fn with_safes(mut self, safes: Vec<VendorSafe>) -> Self {
        self.safes = safes;
        self
    }

    pub fn with_safe_members(mut self, safe_name: &str, members: Vec<VendorSafeAuthorization>) -> Self {
        self.safe_members.insert(safe_name.to_string(), members);
        self
    }

    pub fn auth_call_count(&self) -> u32 {
        self.auth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VaultClient for FakeVaultClient {
    async fn authenticate(&self, _username: &str, _password: &str) -> Result<String, VaultError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_auth.swap(false, Ordering::SeqCst) {
            return Err(VaultError::AuthFailed("injected auth failure".to_string()));
        }
        Ok("fake-token".to_string())
    }

    async fn logoff(&self, _token: &str) -> Result<(), VaultError> {
        Ok(())
    }

    async fn list_users(
        &self,
        _token: &str,
        offset: u64,
        page_size: u64,
        _extended_details: bool,
    ) -> Result<Page<VendorUser>, VaultError> {
        Ok(paginate(&self.users, offset, page_size))
    }

    async fn list_group_memberships(
        &self,
        _token: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page<VendorGroupMembership>, VaultError> {
        Ok(paginate(&self.group_memberships, offset, page_size))
    }

    async fn list_safes(
        &self,
        _token: &str,
        offset: u64,
        page_size: u64,
        _extended_details: bool,
    ) -> Result<Page<VendorSafe>, VaultError> {
        Ok(paginate(&self.safes, offset, page_size))
    }

    async fn list_safe_members(
        &self,
        _token: &str,
        safe_name: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page<VendorSafeAuthorization>, VaultError> {
        match self.safe_members.get(safe_name) {
            Some(members) => Ok(paginate(members, offset, page_size)),
            None => Ok(Page { value: vec![], has_more: false }),
        }
    }

    async fn create_safe(&self, _token: &str, _payload: &serde_json::Value) -> Result<serde_json::Value, VaultError> {
        Ok(serde_json::Value::Null)
    }

    async fn update_safe(
        &self,
        _token: &str,
        _safe_name: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError> {
        Ok(serde_json::Value::Null)
    }

    async fn delete_safe(&self, _token: &str, _safe_name: &str) -> Result<(), VaultError> {
        Ok(())
    }

    async fn grant_access(
        &self,
        _token: &str,
        _safe_name: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError> {
        Ok(serde_json::Value::Null)
    }

    async fn revoke_access(&self, _token: &str, _safe_name: &str, _member_name: &str) -> Result<(), VaultError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_vault_paginates_users_one_based() {
        let vault = FakeVaultClient::new().with_users(vec![
            fake_user("1", "alice"),
            fake_user("2", "bob"),
            fake_user("3", "carol"),
        ]);

        let first = vault.list_users("tok", 1, 2, false).await.unwrap();
        assert_eq!(first.value.len(), 2);
        assert!(first.has_more);

        let second = vault.list_users("tok", 3, 2, false).await.unwrap();
        assert_eq!(second.value.len(), 1);
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn fake_vault_injects_a_single_auth_failure() {
        let vault = FakeVaultClient::new();
        vault.fail_next_auth.store(true, Ordering::SeqCst);

        assert!(vault.authenticate("u", "p").await.is_err());
        assert!(vault.authenticate("u", "p").await.is_ok());
        assert_eq!(vault.auth_call_count(), 2);
    }
}
