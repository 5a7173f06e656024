//! Scenario: membership tombstoning is pair-based.
//!
//! A membership whose user also appears (paired with a different group) in
//! the same sync pass's seen set must not be spared by a loose per-column
//! check — only an exact `(vendor_user_id, vendor_group_id)` match in the
//! seen set may keep it alive.
//!
//! Skips gracefully when `PACP_DATABASE_URL` is not set.

async fn make_pool() -> anyhow::Result<Option<sqlx::PgPool>> {
    let url = match std::env::var(pacp_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let pool = pacp_db::connect(&url).await?;
    pacp_db::migrate(&pool).await?;
    Ok(Some(pool))
}

#[tokio::test]
#[ignore = "requires PACP_DATABASE_URL"]
async fn membership_with_reused_user_and_group_ids_is_still_tombstoned() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };

    let instance = pacp_db::create_upstream_instance(
        &pool,
        pacp_db::NewUpstreamInstance {
            name: "vault-1".into(),
            base_url: "https://vault-1.example".into(),
            username: "svc".into(),
            encrypted_password: "ct:...".into(),
            skip_tls_verify: false,
        },
    )
    .await?;

    // Two memberships sharing one user between two different groups.
    let (_, first_inserted) = pacp_db::upsert_group_membership(
        &pool,
        &instance.id,
        "user-1",
        "group-a",
        "alice",
        "Group A",
        "vault",
    )
    .await?;
    let (_, second_inserted) = pacp_db::upsert_group_membership(
        &pool,
        &instance.id,
        "user-1",
        "group-b",
        "alice",
        "Group B",
        "vault",
    )
    .await?;
    assert!(first_inserted && second_inserted);

    // This pass only saw (user-1, group-a) — a loose per-column `NOT IN`
    // check would spare (user-1, group-b) too, since user-1 appears in the
    // seen set. The pair-based predicate must not.
    let deleted = pacp_db::tombstone_missing_group_memberships(
        &pool,
        &instance.id,
        &["user-1".to_string()],
        &["group-a".to_string()],
    )
    .await?;
    assert_eq!(deleted, 1);

    let live = pacp_db::list_group_memberships(&pool, &instance.id, false).await?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].vendor_group_id, "group-a");

    Ok(())
}

#[tokio::test]
#[ignore = "requires PACP_DATABASE_URL"]
async fn reappearing_user_is_undeleted_on_upsert() -> anyhow::Result<()> {
    let Some(pool) = make_pool().await? else {
        return Ok(());
    };

    let instance = pacp_db::create_upstream_instance(
        &pool,
        pacp_db::NewUpstreamInstance {
            name: "vault-2".into(),
            base_url: "https://vault-2.example".into(),
            username: "svc".into(),
            encrypted_password: "ct:...".into(),
            skip_tls_verify: false,
        },
    )
    .await?;

    let fields = pacp_schemas::MirrorUserFields {
        username: "bob".into(),
        user_type: "EPVUser".into(),
        suspended: false,
        enable_user: true,
        first_name: Some("Bob".into()),
        last_name: None,
        email: None,
        location: None,
        last_login: None,
        expiry: None,
    };

    let (_, first_inserted) =
        pacp_db::upsert_mirror_user(&pool, &instance.id, "user-bob", &fields).await?;
    assert!(first_inserted);
    pacp_db::tombstone_missing_mirror_users(&pool, &instance.id, &[]).await?;

    let after_delete = pacp_db::list_mirror_users(&pool, &instance.id, false).await?;
    assert!(after_delete.is_empty());

    let (_, reappeared_as_new) =
        pacp_db::upsert_mirror_user(&pool, &instance.id, "user-bob", &fields).await?;
    assert!(!reappeared_as_new, "un-delete via ON CONFLICT is an UPDATE branch, not an insert");
    let after_reappear = pacp_db::list_mirror_users(&pool, &instance.id, false).await?;
    assert_eq!(after_reappear.len(), 1);
    assert!(!after_reappear[0].is_deleted);

    Ok(())
}
