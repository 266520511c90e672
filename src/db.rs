//! Persistence gateway. Opens one Postgres pool when `DATABASE_URL` is
//! configured; otherwise every consumer sees `None` and degrades (reads come
//! back empty, writes become no-ops).

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

#[derive(Clone)]
pub struct Db {
    pool: Option<PgPool>,
}

impl Db {
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub async fn connect(database_url: Option<&str>) -> Result<Self, String> {
        let Some(url) = database_url else {
            tracing::warn!("DATABASE_URL not set; persistence disabled");
            return Ok(Self::disabled());
        };

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| format!("database connect failed: {e}"))?;

        init_schema(&pool).await?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn begin(&self) -> Result<Option<Transaction<'static, Postgres>>, String> {
        match &self.pool {
            Some(pool) => pool
                .begin()
                .await
                .map(Some)
                .map_err(|e| e.to_string()),
            None => Ok(None),
        }
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

async fn init_schema(pool: &PgPool) -> Result<(), String> {
    let statements = [
        r#"CREATE TABLE IF NOT EXISTS api_keys (
            id UUID PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_email TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            key_prefix TEXT NOT NULL,
            role TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_used_at TIMESTAMPTZ,
            revoked_at TIMESTAMPTZ,
            is_active BOOLEAN NOT NULL DEFAULT TRUE
        )"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_hash_active
            ON api_keys (key_hash) WHERE is_active"#,
        r#"CREATE TABLE IF NOT EXISTS token_usage (
            id UUID PRIMARY KEY,
            user_id TEXT NOT NULL,
            user_email TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens BIGINT NOT NULL,
            output_tokens BIGINT NOT NULL,
            cost_estimate DOUBLE PRECISION NOT NULL,
            request_category TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_token_usage_user_created
            ON token_usage (user_id, created_at)"#,
        r#"CREATE TABLE IF NOT EXISTS user_budgets (
            user_id TEXT NOT NULL,
            period_start DATE NOT NULL,
            role TEXT NOT NULL,
            monthly_limit BIGINT,
            current_usage BIGINT NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (user_id, period_start),
            CHECK (current_usage >= 0)
        )"#,
        r#"CREATE TABLE IF NOT EXISTS audit_logs (
            id UUID PRIMARY KEY,
            request_id TEXT NOT NULL,
            user_id TEXT,
            user_email TEXT,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
            model TEXT NOT NULL,
            input_tokens BIGINT NOT NULL DEFAULT 0,
            output_tokens BIGINT NOT NULL DEFAULT 0,
            cost_estimate DOUBLE PRECISION NOT NULL DEFAULT 0,
            request_category TEXT,
            source TEXT NOT NULL,
            prompt_hash TEXT NOT NULL,
            prompt_preview TEXT NOT NULL,
            response_preview TEXT NOT NULL,
            latency_ms BIGINT NOT NULL,
            status TEXT NOT NULL
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_audit_logs_request_id
            ON audit_logs (request_id)"#,
        r#"CREATE TABLE IF NOT EXISTS user_profiles (
            user_id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT,
            role TEXT NOT NULL,
            department TEXT,
            identity_groups JSONB NOT NULL DEFAULT '[]'::jsonb,
            first_login TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_login TIMESTAMPTZ NOT NULL DEFAULT now()
        )"#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| format!("schema init failed: {e}"))?;
    }
    Ok(())
}
