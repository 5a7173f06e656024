//! HTTP binding to the upstream vendor vault protocol: authenticate, list
//! pages of users/groups/safes, logoff. Owned by the Session Cache, called
//! by handlers and the Sync Engine — never dialed directly by the HTTP
//! layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Three-tier classification of a failed vault call (spec §4.7 step 4):
/// the auth layer must re-authenticate and retry once, a retryable error
/// should go back to the Scheduler's backoff, and a permanent error should
/// fail the operation outright.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault authentication failed: {0}")]
    AuthFailed(String),
    #[error("vault call failed, retryable: {0}")]
    Retryable(String),
    #[error("vault call failed, permanent: {0}")]
    Permanent(String),
}

impl VaultError {
    pub fn is_auth(&self) -> bool {
        matches!(self, VaultError::AuthFailed(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::Retryable(_))
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> VaultError {
    match status.as_u16() {
        401 | 403 => VaultError::AuthFailed(format!("{status}: {body}")),
        408 | 429 | 500 | 502 | 503 | 504 => {
            VaultError::Retryable(format!("{status}: {body}"))
        }
        _ => VaultError::Permanent(format!("{status}: {body}")),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorUser {
    pub id: String,
    #[serde(rename = "username")]
    pub username: String,
    #[serde(rename = "userType", default)]
    pub user_type: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(rename = "enableUser", default = "default_true")]
    pub enable_user: bool,
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "lastSuccessfulLogin", default)]
    pub last_login: Option<i64>,
    #[serde(rename = "expiryDate", default)]
    pub expiry: Option<i64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorGroupMembership {
    #[serde(rename = "userName")]
    pub username: String,
    #[serde(rename = "groupID")]
    pub group_id: String,
    #[serde(rename = "groupName")]
    pub group_name: String,
    #[serde(rename = "groupType", default)]
    pub group_type: String,
    #[serde(rename = "userID")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorSafe {
    #[serde(rename = "safeName")]
    pub safe_name: String,
    #[serde(rename = "safeUrlId", default)]
    pub safe_url_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorSafeAuthorization {
    #[serde(rename = "userName")]
    pub username: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(flatten)]
    pub permissions: serde_json::Value,
}

/// One page of a vendor list endpoint. The vendor protocol is 1-based:
/// the first page is `offset=0` with `limit=page_size`, and the caller
/// keeps advancing by `value.len()` until a short page is returned
/// (spec §4.7 step 2's pagination loop).
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub value: Vec<T>,
    pub has_more: bool,
}

/// The upstream vendor protocol binding the Session Cache owns one
/// authenticated instance of per `upstream_instance_id` (spec §4.3).
#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<String, VaultError>;
    async fn logoff(&self, token: &str) -> Result<(), VaultError>;

    async fn list_users(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
        extended_details: bool,
    ) -> Result<Page<VendorUser>, VaultError>;

    async fn list_group_memberships(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page<VendorGroupMembership>, VaultError>;

    async fn list_safes(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
        extended_details: bool,
    ) -> Result<Page<VendorSafe>, VaultError>;

    /// Members (and their permission sets) of one safe — the source of
    /// vault authorization reconciliation for both `user_sync`'s per-user
    /// pass and `safe_sync`'s standalone pass (spec §4.7).
    async fn list_safe_members(
        &self,
        token: &str,
        safe_name: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page<VendorSafeAuthorization>, VaultError>;

    async fn create_safe(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError>;

    async fn update_safe(
        &self,
        token: &str,
        safe_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError>;

    async fn delete_safe(&self, token: &str, safe_name: &str) -> Result<(), VaultError>;

    async fn grant_access(
        &self,
        token: &str,
        safe_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError>;

    async fn revoke_access(
        &self,
        token: &str,
        safe_name: &str,
        member_name: &str,
    ) -> Result<(), VaultError>;
}

/// Production `VaultClient` over the HTTP REST surface (spec §6's upstream
/// vendor protocol section). One instance is constructed per
/// `UpstreamInstance`, using an `http_client` built by `pacp-capool` so the
/// instance's TLS trust policy (pinned CA pool, or an explicit
/// `skip_tls_verify` opt-out) is respected.
pub struct HttpVaultClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpVaultClient {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_page<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        path: &str,
        offset: u64,
        page_size: u64,
        extra_query: &[(&str, String)],
    ) -> Result<Page<T>, VaultError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .get(&url)
            .header("Authorization", token)
            .query(&[("offset", offset.to_string()), ("limit", page_size.to_string())]);
        for (k, v) in extra_query {
            req = req.query(&[(k, v)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| VaultError::Retryable(format!("request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| VaultError::Retryable(format!("reading response body failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let value: Vec<T> = serde_json::from_str(&body)
            .map_err(|e| VaultError::Permanent(format!("invalid response body: {e}")))?;
        let has_more = value.len() as u64 == page_size;
        Ok(Page { value, has_more })
    }

    /// POST/PUT/DELETE with an optional JSON body, returning the parsed
    /// JSON response (or `Value::Null` for a body-less success, e.g. a
    /// safe delete / access revoke).
    async fn write_json(
        &self,
        method: reqwest::Method,
        path: &str,
        token: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, VaultError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method, &url).header("Authorization", token);
        if let Some(payload) = payload {
            req = req.json(payload);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| VaultError::Retryable(format!("request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| VaultError::Retryable(format!("reading response body failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| VaultError::Permanent(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn authenticate(&self, username: &str, password: &str) -> Result<String, VaultError> {
        let url = format!("{}/PasswordVault/API/auth/Cyberark/Logon", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| VaultError::Retryable(format!("authenticate request failed: {e}")))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| VaultError::Retryable(format!("reading auth response failed: {e}")))?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => VaultError::AuthFailed(format!("{status}: {body}")),
                other if (500..600).contains(&other) => {
                    VaultError::Retryable(format!("{status}: {body}"))
                }
                _ => VaultError::Permanent(format!("{status}: {body}")),
            });
        }

        // The vendor returns the session token as a bare, quoted JSON string.
        serde_json::from_str::<String>(&body)
            .map_err(|e| VaultError::Permanent(format!("invalid auth token body: {e}")))
    }

    async fn logoff(&self, token: &str) -> Result<(), VaultError> {
        let url = format!("{}/PasswordVault/API/auth/Logoff", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| VaultError::Retryable(format!("logoff request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        Ok(())
    }

    async fn list_users(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
        extended_details: bool,
    ) -> Result<Page<VendorUser>, VaultError> {
        self.get_page(
            token,
            "/PasswordVault/API/Users",
            offset,
            page_size,
            &[("extendedDetails", extended_details.to_string())],
        )
        .await
    }

    async fn list_group_memberships(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page<VendorGroupMembership>, VaultError> {
        self.get_page(
            token,
            "/PasswordVault/API/UserGroups/Members",
            offset,
            page_size,
            &[],
        )
        .await
    }

    async fn list_safes(
        &self,
        token: &str,
        offset: u64,
        page_size: u64,
        extended_details: bool,
    ) -> Result<Page<VendorSafe>, VaultError> {
        self.get_page(
            token,
            "/PasswordVault/API/Safes",
            offset,
            page_size,
            &[("extendedDetails", extended_details.to_string())],
        )
        .await
    }

    async fn list_safe_members(
        &self,
        token: &str,
        safe_name: &str,
        offset: u64,
        page_size: u64,
    ) -> Result<Page<VendorSafeAuthorization>, VaultError> {
        let path = format!("/PasswordVault/API/Safes/{}/Members", urlencode(safe_name));
        self.get_page(token, &path, offset, page_size, &[]).await
    }

    async fn create_safe(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError> {
        self.write_json(reqwest::Method::POST, "/PasswordVault/API/Safes", token, Some(payload))
            .await
    }

    async fn update_safe(
        &self,
        token: &str,
        safe_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError> {
        let path = format!("/PasswordVault/API/Safes/{}", urlencode(safe_name));
        self.write_json(reqwest::Method::PUT, &path, token, Some(payload))
            .await
    }

    async fn delete_safe(&self, token: &str, safe_name: &str) -> Result<(), VaultError> {
        let path = format!("/PasswordVault/API/Safes/{}", urlencode(safe_name));
        self.write_json(reqwest::Method::DELETE, &path, token, None)
            .await?;
        Ok(())
    }

    async fn grant_access(
        &self,
        token: &str,
        safe_name: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, VaultError> {
        let path = format!(
            "/PasswordVault/API/Safes/{}/Members",
            urlencode(safe_name)
        );
        self.write_json(reqwest::Method::POST, &path, token, Some(payload))
            .await
    }

    async fn revoke_access(
        &self,
        token: &str,
        safe_name: &str,
        member_name: &str,
    ) -> Result<(), VaultError> {
        let path = format!(
            "/PasswordVault/API/Safes/{}/Members/{}",
            urlencode(safe_name),
            urlencode(member_name)
        );
        self.write_json(reqwest::Method::DELETE, &path, token, None)
            .await?;
        Ok(())
    }
}

fn urlencode(s: &str) -> String {
    // Minimal path-segment escaping; vendor identifiers (safe/member names)
    // are restricted to a conservative charset in practice, so this only
    // needs to handle spaces and the handful of reserved characters.
    s.replace('%', "%25")
        .replace(' ', "%20")
        .replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_vs_retryable_vs_permanent() {
        assert!(classify_status(reqwest::StatusCode::UNAUTHORIZED, "").is_auth());
        assert!(classify_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        let permanent = classify_status(reqwest::StatusCode::BAD_REQUEST, "");
        assert!(!permanent.is_auth() && !permanent.is_retryable());
    }
}
