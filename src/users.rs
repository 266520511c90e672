//! User-profile store. Profiles are upserted on each successful token-based
//! authentication; `first_login` is preserved across upserts.

use crate::db::Db;

#[derive(Debug, Clone)]
pub struct UpsertProfile {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub department: Option<String>,
    pub identity_groups: Vec<String>,
}

#[derive(Clone)]
pub struct UserProfileStore {
    db: Db,
}

impl UserProfileStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, profile: UpsertProfile) -> Result<(), String> {
        let Some(pool) = self.db.pool() else {
            return Ok(());
        };

        let groups = serde_json::to_value(&profile.identity_groups).map_err(|e| e.to_string())?;
        sqlx::query(
            r#"INSERT INTO user_profiles
                (user_id, email, display_name, role, department, identity_groups, first_login, last_login)
               VALUES ($1, $2, $3, $4, $5, $6, now(), now())
               ON CONFLICT (user_id)
               DO UPDATE SET email = EXCLUDED.email,
                             display_name = EXCLUDED.display_name,
                             role = EXCLUDED.role,
                             department = EXCLUDED.department,
                             identity_groups = EXCLUDED.identity_groups,
                             last_login = now()"#,
        )
        .bind(&profile.user_id)
        .bind(&profile.email)
        .bind(&profile.display_name)
        .bind(&profile.role)
        .bind(&profile.department)
        .bind(groups)
        .execute(pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}
