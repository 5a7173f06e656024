use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;

use pacp_schemas::{MirrorUserFields, PlaneError, SyncResult, UpstreamInstance};
use pacp_session::SessionCache;
use pacp_vault::{VaultClient, VaultError};

/// Up to 3 attempts against a retryable (5xx/timeout/network) error per
/// page, beyond which the sync surfaces `PlaneError::Transient` (spec
/// §4.7 step 4). Authentication retries against `VaultError::AuthFailed`
/// don't count against this budget — they re-authenticate and retry the
/// same page unconditionally.
const MAX_SERVER_RETRIES: u32 = 3;

/// Cooperative cancellation checked at page and per-safe boundaries
/// (spec §4.7 edge cases: stop between pages without corrupting partial
/// state, never running the tombstone sweep on a partial seen set).
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn cancellation_error() -> PlaneError {
    PlaneError::Internal("sync cancelled between pages".to_string())
}

/// A live `(client, token)` pair handed to the engine by its caller —
/// ordinarily the result of `SessionCache::get_or_create`, but a plain
/// struct so tests can substitute a fake `VaultClient` without dialing
/// the Session Cache's real HTTP path.
pub struct Session {
    pub client: Arc<dyn VaultClient>,
    pub token: String,
}

/// Milliseconds-since-epoch vendor timestamps must be converted to
/// absolute UTC times (spec §4.7 edge cases); an out-of-range value
/// degrades to "now" rather than panicking or silently truncating.
fn epoch_ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Run one vault call with up to [`MAX_SERVER_RETRIES`] attempts, forcing
/// re-authentication (uncounted) on an auth failure and a linearly
/// increasing sleep on a retryable failure (spec §4.7 step 4).
async fn with_retry<F, Fut, T>(
    session: &mut Session,
    sessions: &SessionCache,
    instance: &UpstreamInstance,
    mut call: F,
) -> Result<T, PlaneError>
where
    F: FnMut(Arc<dyn VaultClient>, String) -> Fut,
    Fut: Future<Output = Result<T, VaultError>>,
{
    let mut server_retries = 0u32;
    loop {
        match call(session.client.clone(), session.token.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_auth() => {
                tracing::warn!(instance_id = %instance.id, "sync/reauthenticating-after-401");
                let (client, token) = sessions
                    .refresh(instance)
                    .await
                    .map_err(|err| PlaneError::AuthUpstream(err.to_string()))?;
                session.client = client;
                session.token = token;
            }
            Err(e) if e.is_retryable() => {
                server_retries += 1;
                if server_retries > MAX_SERVER_RETRIES {
                    return Err(PlaneError::Transient(e.to_string()));
                }
                tokio::time::sleep(Duration::from_secs(server_retries as u64)).await;
            }
            Err(e) => return Err(PlaneError::Permanent(e.to_string())),
        }
    }
}

/// `user_sync`'s user pass: paginate `list_users`, upsert each into
/// `mirror_users`, then tombstone everything not seen this pass (spec
/// §4.7 steps 3-7, user half).
pub async fn sync_users(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &UpstreamInstance,
    mut session: Session,
    page_size: u64,
    cancel: &CancelSignal,
) -> Result<SyncResult, PlaneError> {
    let mut result = SyncResult::default();
    let mut seen_user_ids: Vec<String> = Vec::new();
    let mut offset = 1u64;

    loop {
        if cancel.is_cancelled() {
            return Err(cancellation_error());
        }

        let page = with_retry(&mut session, sessions, instance, |client, token| async move {
            client.list_users(&token, offset, page_size, true).await
        })
        .await?;

        if page.value.is_empty() {
            break;
        }

        for vendor_user in &page.value {
            seen_user_ids.push(vendor_user.id.clone());

            let fields = MirrorUserFields {
                username: vendor_user.username.clone(),
                user_type: vendor_user.user_type.clone(),
                suspended: vendor_user.suspended,
                enable_user: vendor_user.enable_user,
                first_name: vendor_user.first_name.clone(),
                last_name: vendor_user.last_name.clone(),
                email: vendor_user.email.clone(),
                location: vendor_user.location.clone(),
                last_login: vendor_user.last_login.map(epoch_ms_to_utc),
                expiry: vendor_user.expiry.map(epoch_ms_to_utc),
            };

            match pacp_db::upsert_mirror_user(db, &instance.id, &vendor_user.id, &fields).await {
                Ok((_, inserted)) => {
                    result.total_processed += 1;
                    if inserted {
                        result.new_count += 1;
                    } else {
                        result.updated_count += 1;
                    }
                }
                Err(e) => result
                    .errors
                    .push(format!("user {}: {e}", vendor_user.id)),
            }
        }

        if !page.has_more {
            break;
        }
        offset += page.value.len() as u64;
    }

    let deleted = pacp_db::tombstone_missing_mirror_users(db, &instance.id, &seen_user_ids)
        .await
        .map_err(|e| PlaneError::Internal(e.to_string()))?;
    result.deleted_count += deleted;

    Ok(result)
}

/// `group_sync`'s pass: paginate `list_group_memberships` and reconcile
/// `mirror_group_memberships` using the pair-based `(user_id, group_id)`
/// tombstone predicate spec §9 mandates (spec §4.7 step 7).
pub async fn sync_groups(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &UpstreamInstance,
    mut session: Session,
    page_size: u64,
    cancel: &CancelSignal,
) -> Result<SyncResult, PlaneError> {
    let mut result = SyncResult::default();
    let mut seen_user_ids: Vec<String> = Vec::new();
    let mut seen_group_ids: Vec<String> = Vec::new();
    let mut offset = 1u64;

    loop {
        if cancel.is_cancelled() {
            return Err(cancellation_error());
        }

        let page = with_retry(&mut session, sessions, instance, |client, token| async move {
            client.list_group_memberships(&token, offset, page_size).await
        })
        .await?;

        if page.value.is_empty() {
            break;
        }

        for membership in &page.value {
            seen_user_ids.push(membership.user_id.clone());
            seen_group_ids.push(membership.group_id.clone());

            match pacp_db::upsert_group_membership(
                db,
                &instance.id,
                &membership.user_id,
                &membership.group_id,
                &membership.username,
                &membership.group_name,
                &membership.group_type,
            )
            .await
            {
                Ok((_, inserted)) => {
                    result.total_processed += 1;
                    if inserted {
                        result.new_count += 1;
                    } else {
                        result.updated_count += 1;
                    }
                }
                Err(e) => result.errors.push(format!(
                    "membership {}:{}: {e}",
                    membership.user_id, membership.group_id
                )),
            }
        }

        if !page.has_more {
            break;
        }
        offset += page.value.len() as u64;
    }

    let deleted = pacp_db::tombstone_missing_group_memberships(
        db,
        &instance.id,
        &seen_user_ids,
        &seen_group_ids,
    )
    .await
    .map_err(|e| PlaneError::Internal(e.to_string()))?;
    result.deleted_count += deleted;

    Ok(result)
}

/// `safe_sync`'s pass: paginate `list_safes`, then each safe's member
/// list, reconciling `mirror_vault_authorizations` keyed on
/// `(vendor_user_id, authorization_string)` with the same pair-based
/// tombstone discipline as memberships (spec §4.7 step 7,
/// "Authorizations").
pub async fn sync_safes(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &UpstreamInstance,
    mut session: Session,
    page_size: u64,
    cancel: &CancelSignal,
) -> Result<SyncResult, PlaneError> {
    let mut result = SyncResult::default();
    let mut seen_user_ids: Vec<String> = Vec::new();
    let mut seen_auth_strings: Vec<String> = Vec::new();
    let mut safe_offset = 1u64;

    loop {
        if cancel.is_cancelled() {
            return Err(cancellation_error());
        }

        let safes_page = with_retry(&mut session, sessions, instance, |client, token| async move {
            client.list_safes(&token, safe_offset, page_size, true).await
        })
        .await?;

        if safes_page.value.is_empty() {
            break;
        }

        for safe in &safes_page.value {
            let mut member_offset = 1u64;
            loop {
                if cancel.is_cancelled() {
                    return Err(cancellation_error());
                }

                let members_page =
                    with_retry(&mut session, sessions, instance, |client, token| async move {
                        client
                            .list_safe_members(&token, &safe.safe_name, member_offset, page_size)
                            .await
                    })
                    .await?;

                if members_page.value.is_empty() {
                    break;
                }

                for member in &members_page.value {
                    let authorization_string = format!("{}:{}", safe.safe_name, member.permissions);
                    seen_user_ids.push(member.user_id.clone());
                    seen_auth_strings.push(authorization_string.clone());

                    match pacp_db::upsert_vault_authorization(
                        db,
                        &instance.id,
                        &member.user_id,
                        &authorization_string,
                    )
                    .await
                    {
                        Ok((_, inserted)) => {
                            result.total_processed += 1;
                            if inserted {
                                result.new_count += 1;
                            } else {
                                result.updated_count += 1;
                            }
                        }
                        Err(e) => result.errors.push(format!(
                            "authorization {}@{}: {e}",
                            member.user_id, safe.safe_name
                        )),
                    }
                }

                if !members_page.has_more {
                    break;
                }
                member_offset += members_page.value.len() as u64;
            }
        }

        if !safes_page.has_more {
            break;
        }
        safe_offset += safes_page.value.len() as u64;
    }

    let deleted = pacp_db::tombstone_missing_vault_authorizations(
        db,
        &instance.id,
        &seen_user_ids,
        &seen_auth_strings,
    )
    .await
    .map_err(|e| PlaneError::Internal(e.to_string()))?;
    result.deleted_count += deleted;

    Ok(result)
}

fn merge_results(results: [SyncResult; 3]) -> SyncResult {
    let mut merged = SyncResult::default();
    for r in results {
        merged.total_processed += r.total_processed;
        merged.new_count += r.new_count;
        merged.updated_count += r.updated_count;
        merged.deleted_count += r.deleted_count;
        merged.errors.extend(r.errors);
    }
    merged
}

/// The `user_sync` operation type is "the hardest handler" (spec §4.7
/// heading): it reconciles users, their group memberships, and their
/// vault authorizations together, where `group_sync`/`safe_sync` each
/// only run their own standalone pass. A fresh session is acquired
/// per sub-pass since each may have re-authenticated independently.
pub async fn run_full_user_sync(
    db: &PgPool,
    sessions: &SessionCache,
    instance: &UpstreamInstance,
    page_size: u64,
    cancel: &CancelSignal,
) -> Result<SyncResult, PlaneError> {
    let users_session = session_for(sessions, instance).await?;
    let users = sync_users(db, sessions, instance, users_session, page_size, cancel).await?;

    let groups_session = session_for(sessions, instance).await?;
    let groups = sync_groups(db, sessions, instance, groups_session, page_size, cancel).await?;

    let safes_session = session_for(sessions, instance).await?;
    let safes = sync_safes(db, sessions, instance, safes_session, page_size, cancel).await?;

    Ok(merge_results([users, groups, safes]))
}

async fn session_for(sessions: &SessionCache, instance: &UpstreamInstance) -> Result<Session, PlaneError> {
    let (client, token) = sessions
        .get_or_create(instance)
        .await
        .map_err(|e| PlaneError::AuthUpstream(e.to_string()))?;
    Ok(Session { client, token })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_conversion_round_trips_a_known_instant() {
        let ms = 1_700_000_000_000_i64;
        let dt = epoch_ms_to_utc(ms);
        assert_eq!(dt.timestamp_millis(), ms);
    }

    #[test]
    fn merge_results_sums_counters_and_concatenates_errors() {
        let a = SyncResult {
            total_processed: 2,
            new_count: 1,
            updated_count: 1,
            deleted_count: 0,
            errors: vec!["a".to_string()],
        };
        let b = SyncResult {
            total_processed: 3,
            new_count: 0,
            updated_count: 3,
            deleted_count: 1,
            errors: vec![],
        };
        let c = SyncResult::default();

        let merged = merge_results([a, b, c]);
        assert_eq!(merged.total_processed, 5);
        assert_eq!(merged.new_count, 1);
        assert_eq!(merged.updated_count, 4);
        assert_eq!(merged.deleted_count, 1);
        assert_eq!(merged.errors, vec!["a".to_string()]);
    }

    #[test]
    fn cancel_signal_starts_clear() {
        let cancel = CancelSignal::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }
}
