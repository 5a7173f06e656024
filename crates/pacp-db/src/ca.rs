use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use pacp_schemas::{ids, new_id, CertificateAuthority, ChainCertInfo};

#[derive(Debug, Clone)]
pub struct NewCertificateAuthority {
    pub name: String,
    pub fingerprint: String,
    pub pem: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: chrono::DateTime<chrono::Utc>,
    pub not_after: chrono::DateTime<chrono::Utc>,
    pub is_root: bool,
    pub is_intermediate: bool,
    pub chain_info: Vec<ChainCertInfo>,
}

fn row_to_ca(row: sqlx::postgres::PgRow) -> Result<CertificateAuthority> {
    let chain_info_json: serde_json::Value = row.try_get("chain_info")?;
    let chain_info: Vec<ChainCertInfo> =
        serde_json::from_value(chain_info_json).context("corrupt chain_info json")?;

    Ok(CertificateAuthority {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        fingerprint: row.try_get("fingerprint")?,
        pem: row.try_get("pem")?,
        subject: row.try_get("subject")?,
        issuer: row.try_get("issuer")?,
        not_before: row.try_get("not_before")?,
        not_after: row.try_get("not_after")?,
        is_root: row.try_get("is_root")?,
        is_intermediate: row.try_get("is_intermediate")?,
        chain_info,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn create_certificate_authority(
    pool: &PgPool,
    new: NewCertificateAuthority,
) -> Result<CertificateAuthority> {
    let id = new_id(ids::CA_PREFIX);
    let chain_info_json =
        serde_json::to_value(&new.chain_info).context("serialize chain_info failed")?;

    let row = sqlx::query(
        r#"
        insert into certificate_authorities
            (id, name, fingerprint, pem, subject, issuer, not_before, not_after,
             is_root, is_intermediate, chain_info)
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        returning *
        "#,
    )
    .bind(&id)
    .bind(&new.name)
    .bind(&new.fingerprint)
    .bind(&new.pem)
    .bind(&new.subject)
    .bind(&new.issuer)
    .bind(new.not_before)
    .bind(new.not_after)
    .bind(new.is_root)
    .bind(new.is_intermediate)
    .bind(chain_info_json)
    .fetch_one(pool)
    .await
    .context("create_certificate_authority insert failed")?;

    row_to_ca(row)
}

pub async fn get_certificate_authority(
    pool: &PgPool,
    id: &str,
) -> Result<Option<CertificateAuthority>> {
    let row = sqlx::query("select * from certificate_authorities where id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("get_certificate_authority query failed")?;
    row.map(row_to_ca).transpose()
}

/// Rows the CA Pool should fold into its trust store rebuild (spec §4.2).
pub async fn list_active_certificate_authorities(
    pool: &PgPool,
) -> Result<Vec<CertificateAuthority>> {
    let rows = sqlx::query(
        "select * from certificate_authorities where is_active order by created_at",
    )
    .fetch_all(pool)
    .await
    .context("list_active_certificate_authorities query failed")?;
    rows.into_iter().map(row_to_ca).collect()
}

pub async fn list_certificate_authorities(pool: &PgPool) -> Result<Vec<CertificateAuthority>> {
    let rows = sqlx::query("select * from certificate_authorities order by created_at")
        .fetch_all(pool)
        .await
        .context("list_certificate_authorities query failed")?;
    rows.into_iter().map(row_to_ca).collect()
}

pub async fn set_certificate_authority_active(
    pool: &PgPool,
    id: &str,
    is_active: bool,
) -> Result<bool> {
    let row = sqlx::query(
        "update certificate_authorities set is_active = $2, updated_at = now()
         where id = $1 returning id",
    )
    .bind(id)
    .bind(is_active)
    .fetch_optional(pool)
    .await
    .context("set_certificate_authority_active update failed")?;
    Ok(row.is_some())
}

pub async fn delete_certificate_authority(pool: &PgPool, id: &str) -> Result<bool> {
    let result = sqlx::query("delete from certificate_authorities where id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("delete_certificate_authority failed")?;
    Ok(result.rows_affected() > 0)
}
