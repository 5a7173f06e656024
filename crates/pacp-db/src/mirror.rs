use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use pacp_schemas::{ids, new_id, MirrorGroupMembership, MirrorUser, MirrorUserFields, MirrorVaultAuthorization};

fn row_to_mirror_user(row: sqlx::postgres::PgRow) -> Result<MirrorUser> {
    Ok(MirrorUser {
        id: row.try_get("id")?,
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        vendor_user_id: row.try_get("vendor_user_id")?,
        username: row.try_get("username")?,
        user_type: row.try_get("user_type")?,
        suspended: row.try_get("suspended")?,
        enable_user: row.try_get("enable_user")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        location: row.try_get("location")?,
        last_login: row.try_get("last_login")?,
        expiry: row.try_get("expiry")?,
        last_synced_at: row.try_get("last_synced_at")?,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

/// Insert-or-update a mirror user row for one sync pass (spec §4.7 step 6).
/// Un-deletes a previously tombstoned row that has reappeared upstream.
///
/// Returns whether the row was newly inserted (`xmax = 0` is the standard
/// trick for telling an insert apart from an upsert's update branch on the
/// same `RETURNING` clause), so the Sync Engine can report
/// `new_count`/`updated_count` separately.
pub async fn upsert_mirror_user(
    pool: &PgPool,
    upstream_instance_id: &str,
    vendor_user_id: &str,
    fields: &MirrorUserFields,
) -> Result<(MirrorUser, bool)> {
    let id = new_id(ids::MIRROR_USER_PREFIX);
    let row = sqlx::query(
        r#"
        insert into mirror_users
            (id, upstream_instance_id, vendor_user_id, username, user_type,
             suspended, enable_user, first_name, last_name, email, location,
             last_login, expiry, last_synced_at, is_deleted, deleted_at)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now(), false, null)
        on conflict (upstream_instance_id, vendor_user_id) do update
            set username = excluded.username,
                user_type = excluded.user_type,
                suspended = excluded.suspended,
                enable_user = excluded.enable_user,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                email = excluded.email,
                location = excluded.location,
                last_login = excluded.last_login,
                expiry = excluded.expiry,
                last_synced_at = now(),
                is_deleted = false,
                deleted_at = null
        returning *, (xmax = 0) as inserted
        "#,
    )
    .bind(&id)
    .bind(upstream_instance_id)
    .bind(vendor_user_id)
    .bind(&fields.username)
    .bind(&fields.user_type)
    .bind(fields.suspended)
    .bind(fields.enable_user)
    .bind(&fields.first_name)
    .bind(&fields.last_name)
    .bind(&fields.email)
    .bind(&fields.location)
    .bind(fields.last_login)
    .bind(fields.expiry)
    .fetch_one(pool)
    .await
    .context("upsert_mirror_user failed")?;

    let inserted: bool = row.try_get("inserted")?;
    Ok((row_to_mirror_user(row)?, inserted))
}

/// Tombstone mirror users for `upstream_instance_id` whose `vendor_user_id`
/// was not in this sync pass's seen set (spec §4.7 step 7).
pub async fn tombstone_missing_mirror_users(
    pool: &PgPool,
    upstream_instance_id: &str,
    seen_vendor_user_ids: &[String],
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        update mirror_users
           set is_deleted = true, deleted_at = now()
         where upstream_instance_id = $1
           and not is_deleted
           and not (vendor_user_id = any($2))
        "#,
    )
    .bind(upstream_instance_id)
    .bind(seen_vendor_user_ids)
    .execute(pool)
    .await
    .context("tombstone_missing_mirror_users failed")?;

    Ok(result.rows_affected() as i64)
}

pub async fn list_mirror_users(
    pool: &PgPool,
    upstream_instance_id: &str,
    include_deleted: bool,
) -> Result<Vec<MirrorUser>> {
    let rows = if include_deleted {
        sqlx::query("select * from mirror_users where upstream_instance_id = $1")
            .bind(upstream_instance_id)
            .fetch_all(pool)
            .await
    } else {
        sqlx::query(
            "select * from mirror_users where upstream_instance_id = $1 and not is_deleted",
        )
        .bind(upstream_instance_id)
        .fetch_all(pool)
        .await
    }
    .context("list_mirror_users query failed")?;

    rows.into_iter().map(row_to_mirror_user).collect()
}

fn row_to_membership(row: sqlx::postgres::PgRow) -> Result<MirrorGroupMembership> {
    Ok(MirrorGroupMembership {
        id: row.try_get("id")?,
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        vendor_user_id: row.try_get("vendor_user_id")?,
        vendor_group_id: row.try_get("vendor_group_id")?,
        username: row.try_get("username")?,
        group_name: row.try_get("group_name")?,
        group_type: row.try_get("group_type")?,
        last_synced_at: row.try_get("last_synced_at")?,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_group_membership(
    pool: &PgPool,
    upstream_instance_id: &str,
    vendor_user_id: &str,
    vendor_group_id: &str,
    username: &str,
    group_name: &str,
    group_type: &str,
) -> Result<(MirrorGroupMembership, bool)> {
    let id = new_id(ids::MIRROR_MEMBERSHIP_PREFIX);
    let row = sqlx::query(
        r#"
        insert into mirror_group_memberships
            (id, upstream_instance_id, vendor_user_id, vendor_group_id,
             username, group_name, group_type, last_synced_at, is_deleted, deleted_at)
        values ($1, $2, $3, $4, $5, $6, $7, now(), false, null)
        on conflict (upstream_instance_id, vendor_user_id, vendor_group_id) do update
            set username = excluded.username,
                group_name = excluded.group_name,
                group_type = excluded.group_type,
                last_synced_at = now(),
                is_deleted = false,
                deleted_at = null
        returning *, (xmax = 0) as inserted
        "#,
    )
    .bind(&id)
    .bind(upstream_instance_id)
    .bind(vendor_user_id)
    .bind(vendor_group_id)
    .bind(username)
    .bind(group_name)
    .bind(group_type)
    .fetch_one(pool)
    .await
    .context("upsert_group_membership failed")?;

    let inserted: bool = row.try_get("inserted")?;
    Ok((row_to_membership(row)?, inserted))
}

/// Tombstone memberships whose `(vendor_user_id, vendor_group_id)` pair was
/// not seen this pass. This MUST be a pair-based `NOT EXISTS` against the
/// full seen-pair set, never a per-column `NOT IN`/`OR` disjunction — the
/// latter tombstones a membership the moment either column value appears
/// anywhere else in the seen set, which is wrong (spec §4.7/§9).
pub async fn tombstone_missing_group_memberships(
    pool: &PgPool,
    upstream_instance_id: &str,
    seen_user_ids: &[String],
    seen_group_ids: &[String],
) -> Result<i64> {
    debug_assert_eq!(seen_user_ids.len(), seen_group_ids.len());

    let result = sqlx::query(
        r#"
        with seen(vendor_user_id, vendor_group_id) as (
            select * from unnest($2::text[], $3::text[])
        )
        update mirror_group_memberships m
           set is_deleted = true, deleted_at = now()
         where m.upstream_instance_id = $1
           and not m.is_deleted
           and not exists (
               select 1 from seen s
               where s.vendor_user_id = m.vendor_user_id
                 and s.vendor_group_id = m.vendor_group_id
           )
        "#,
    )
    .bind(upstream_instance_id)
    .bind(seen_user_ids)
    .bind(seen_group_ids)
    .execute(pool)
    .await
    .context("tombstone_missing_group_memberships failed")?;

    Ok(result.rows_affected() as i64)
}

pub async fn list_group_memberships(
    pool: &PgPool,
    upstream_instance_id: &str,
    include_deleted: bool,
) -> Result<Vec<MirrorGroupMembership>> {
    let rows = if include_deleted {
        sqlx::query("select * from mirror_group_memberships where upstream_instance_id = $1")
            .bind(upstream_instance_id)
            .fetch_all(pool)
            .await
    } else {
        sqlx::query(
            "select * from mirror_group_memberships
             where upstream_instance_id = $1 and not is_deleted",
        )
        .bind(upstream_instance_id)
        .fetch_all(pool)
        .await
    }
    .context("list_group_memberships query failed")?;

    rows.into_iter().map(row_to_membership).collect()
}

fn row_to_authorization(row: sqlx::postgres::PgRow) -> Result<MirrorVaultAuthorization> {
    Ok(MirrorVaultAuthorization {
        id: row.try_get("id")?,
        upstream_instance_id: row.try_get("upstream_instance_id")?,
        vendor_user_id: row.try_get("vendor_user_id")?,
        authorization_string: row.try_get("authorization_string")?,
        last_synced_at: row.try_get("last_synced_at")?,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

pub async fn upsert_vault_authorization(
    pool: &PgPool,
    upstream_instance_id: &str,
    vendor_user_id: &str,
    authorization_string: &str,
) -> Result<(MirrorVaultAuthorization, bool)> {
    let id = new_id(ids::MIRROR_AUTH_PREFIX);
    let row = sqlx::query(
        r#"
        insert into mirror_vault_authorizations
            (id, upstream_instance_id, vendor_user_id, authorization_string,
             last_synced_at, is_deleted, deleted_at)
        values ($1, $2, $3, $4, now(), false, null)
        on conflict (upstream_instance_id, vendor_user_id, authorization_string) do update
            set last_synced_at = now(),
                is_deleted = false,
                deleted_at = null
        returning *, (xmax = 0) as inserted
        "#,
    )
    .bind(&id)
    .bind(upstream_instance_id)
    .bind(vendor_user_id)
    .bind(authorization_string)
    .fetch_one(pool)
    .await
    .context("upsert_vault_authorization failed")?;

    let inserted: bool = row.try_get("inserted")?;
    Ok((row_to_authorization(row)?, inserted))
}

/// Same pair-based tombstone discipline as memberships, keyed on
/// `(vendor_user_id, authorization_string)` (spec §4.7).
pub async fn tombstone_missing_vault_authorizations(
    pool: &PgPool,
    upstream_instance_id: &str,
    seen_user_ids: &[String],
    seen_authorization_strings: &[String],
) -> Result<i64> {
    debug_assert_eq!(seen_user_ids.len(), seen_authorization_strings.len());

    let result = sqlx::query(
        r#"
        with seen(vendor_user_id, authorization_string) as (
            select * from unnest($2::text[], $3::text[])
        )
        update mirror_vault_authorizations m
           set is_deleted = true, deleted_at = now()
         where m.upstream_instance_id = $1
           and not m.is_deleted
           and not exists (
               select 1 from seen s
               where s.vendor_user_id = m.vendor_user_id
                 and s.authorization_string = m.authorization_string
           )
        "#,
    )
    .bind(upstream_instance_id)
    .bind(seen_user_ids)
    .bind(seen_authorization_strings)
    .execute(pool)
    .await
    .context("tombstone_missing_vault_authorizations failed")?;

    Ok(result.rows_affected() as i64)
}
