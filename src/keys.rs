//! API-key service: generation, hashing, lookup, revocation, atomic rotation.
//!
//! Raw keys are `dynamo-sk-` + 48 lowercase hex chars (24 random bytes) and
//! exist only in the create/rotate response; the store keeps the SHA-256 hash
//! and a 12-char display prefix. The partial unique index on
//! `key_hash WHERE is_active` backs the auth hot path.

use crate::db::Db;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

pub const KEY_PREFIX_LEN: usize = 12;

static KEY_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dynamo-sk-[0-9a-f]{48}$").unwrap());

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: String,
    pub user_email: String,
    pub key_prefix: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

pub fn generate_raw_key() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    format!("dynamo-sk-{}", hex::encode(bytes))
}

pub fn is_valid_key_format(key: &str) -> bool {
    KEY_FORMAT.is_match(key)
}

pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn key_prefix(key: &str) -> String {
    key.chars().take(KEY_PREFIX_LEN).collect()
}

/// `alice.smith@dynamo.works` → `alice.smith`.
pub fn user_id_from_email(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}

#[derive(Clone)]
pub struct ApiKeyStore {
    db: Db,
}

impl ApiKeyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a fresh active key. The raw key is returned exactly once and
    /// never stored.
    pub async fn create(&self, user_email: &str, role: &str) -> Result<(ApiKey, String), String> {
        let Some(pool) = self.db.pool() else {
            return Err("persistence disabled".to_string());
        };

        let raw = generate_raw_key();
        let key = ApiKey {
            id: Uuid::new_v4(),
            user_id: user_id_from_email(user_email),
            user_email: user_email.to_string(),
            key_prefix: key_prefix(&raw),
            role: role.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
            is_active: true,
        };

        sqlx::query(
            r#"INSERT INTO api_keys
                (id, user_id, user_email, key_hash, key_prefix, role, created_at, is_active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)"#,
        )
        .bind(key.id)
        .bind(&key.user_id)
        .bind(&key.user_email)
        .bind(hash_key(&raw))
        .bind(&key.key_prefix)
        .bind(&key.role)
        .bind(key.created_at)
        .execute(pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok((key, raw))
    }

    pub async fn list(&self) -> Result<Vec<ApiKey>, String> {
        let Some(pool) = self.db.pool() else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"SELECT id, user_id, user_email, key_prefix, role, created_at,
                      last_used_at, revoked_at, is_active
               FROM api_keys ORDER BY created_at DESC"#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_api_key).collect()
    }

    /// Mark a key inactive. Returns whether anything changed, so a second
    /// revoke of the same key reports `false`.
    pub async fn revoke(&self, id: Uuid) -> Result<bool, String> {
        let Some(pool) = self.db.pool() else {
            return Ok(false);
        };
        let result = sqlx::query(
            "UPDATE api_keys SET is_active = FALSE, revoked_at = now() WHERE id = $1 AND is_active",
        )
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// Retire the active row and mint a replacement carrying the same
    /// identity, in one transaction. The `FOR UPDATE` lock keeps two
    /// concurrent rotations of the same key from both succeeding.
    pub async fn rotate(&self, id: Uuid) -> Result<Option<(ApiKey, String)>, String> {
        let Some(mut tx) = self.db.begin().await? else {
            return Err("persistence disabled".to_string());
        };

        let row = sqlx::query(
            r#"SELECT user_id, user_email, role FROM api_keys
               WHERE id = $1 AND is_active FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        let Some(row) = row else {
            tx.rollback().await.map_err(|e| e.to_string())?;
            return Ok(None);
        };
        let user_id: String = row.try_get("user_id").map_err(|e| e.to_string())?;
        let user_email: String = row.try_get("user_email").map_err(|e| e.to_string())?;
        let role: String = row.try_get("role").map_err(|e| e.to_string())?;

        sqlx::query(
            "UPDATE api_keys SET is_active = FALSE, revoked_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        let raw = generate_raw_key();
        let replacement = ApiKey {
            id: Uuid::new_v4(),
            user_id,
            user_email,
            key_prefix: key_prefix(&raw),
            role,
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
            is_active: true,
        };

        sqlx::query(
            r#"INSERT INTO api_keys
                (id, user_id, user_email, key_hash, key_prefix, role, created_at, is_active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)"#,
        )
        .bind(replacement.id)
        .bind(&replacement.user_id)
        .bind(&replacement.user_email)
        .bind(hash_key(&raw))
        .bind(&replacement.key_prefix)
        .bind(&replacement.role)
        .bind(replacement.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        tx.commit().await.map_err(|e| e.to_string())?;
        Ok(Some((replacement, raw)))
    }

    /// Active-key lookup by hash. A hit schedules a fire-and-forget
    /// `last_used_at` touch.
    pub async fn lookup_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, String> {
        let Some(pool) = self.db.pool() else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"SELECT id, user_id, user_email, key_prefix, role, created_at,
                      last_used_at, revoked_at, is_active
               FROM api_keys WHERE key_hash = $1 AND is_active"#,
        )
        .bind(key_hash)
        .fetch_optional(pool)
        .await
        .map_err(|e| e.to_string())?;

        let Some(row) = row else {
            return Ok(None);
        };
        let key = row_to_api_key(&row)?;

        let store = self.clone();
        let key_id = key.id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_last_used(key_id).await {
                tracing::warn!("failed to update api key last_used_at: {e}");
            }
        });

        Ok(Some(key))
    }

    async fn touch_last_used(&self, id: Uuid) -> Result<(), String> {
        let Some(pool) = self.db.pool() else {
            return Ok(());
        };
        sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_api_key(row: &PgRow) -> Result<ApiKey, String> {
    Ok(ApiKey {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        user_email: row.try_get("user_email").map_err(|e| e.to_string())?,
        key_prefix: row.try_get("key_prefix").map_err(|e| e.to_string())?,
        role: row.try_get("role").map_err(|e| e.to_string())?,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        last_used_at: row.try_get("last_used_at").map_err(|e| e.to_string())?,
        revoked_at: row.try_get("revoked_at").map_err(|e| e.to_string())?,
        is_active: row.try_get("is_active").map_err(|e| e.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_pass_format_validation() {
        for _ in 0..16 {
            let key = generate_raw_key();
            assert_eq!(key.len(), 58);
            assert!(is_valid_key_format(&key), "{key} failed format check");
        }
    }

    #[test]
    fn generated_keys_are_distinct() {
        let a = generate_raw_key();
        let b = generate_raw_key();
        assert_ne!(a, b);
    }

    #[test]
    fn format_rejects_near_misses() {
        assert!(!is_valid_key_format("dynamo-sk-"));
        assert!(!is_valid_key_format(&format!("dynamo-sk-{}", "a".repeat(47))));
        assert!(!is_valid_key_format(&format!("dynamo-sk-{}", "a".repeat(49))));
        assert!(!is_valid_key_format(&format!("dynamo-sk-{}", "A".repeat(48))));
        assert!(!is_valid_key_format(&format!("sk-{}", "a".repeat(48))));
    }

    #[test]
    fn hash_is_sixty_four_hex_chars_and_stable() {
        let key = "dynamo-sk-0123456789abcdef0123456789abcdef0123456789abcdef";
        let hash = hash_key(key);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_key(key));
    }

    #[test]
    fn prefix_is_first_twelve_chars() {
        let key = generate_raw_key();
        let prefix = key_prefix(&key);
        assert_eq!(prefix.len(), KEY_PREFIX_LEN);
        assert!(key.starts_with(&prefix));
        assert!(prefix.starts_with("dynamo-sk-"));
    }

    #[test]
    fn user_id_is_email_localpart() {
        assert_eq!(user_id_from_email("alice@dynamo.works"), "alice");
        assert_eq!(user_id_from_email("not-an-email"), "not-an-email");
    }
}
