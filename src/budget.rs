//! Budget math and the token-usage ledger.
//!
//! The pure half (period arithmetic, threshold evaluation, cost estimation)
//! has no store dependency. The persistent half writes one `token_usage` row
//! and upserts the materialized `user_budgets` counter in a single
//! transaction; the `ON CONFLICT` update serializes concurrent increments for
//! the same `(user_id, period_start)` row.

use crate::catalog;
use crate::db::Db;
use chrono::{Datelike, NaiveDate, Utc};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

pub fn current_period_start() -> NaiveDate {
    let now = Utc::now().date_naive();
    NaiveDate::from_ymd_opt(now.year(), now.month(), 1).expect("first of month is always valid")
}

pub fn next_reset_date() -> NaiveDate {
    let start = current_period_start();
    let (year, month) = if start.month() == 12 {
        (start.year() + 1, 1)
    } else {
        (start.year(), start.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("first of month is always valid")
}

/// Monthly token budget for a role; unknown roles get the default role's.
pub fn monthly_budget(role: &str) -> Option<i64> {
    catalog::role_def(role).monthly_token_budget
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetEvaluation {
    pub exceeded: bool,
    pub warning: bool,
    pub percent_used: i64,
}

pub fn evaluate_budget(used: i64, limit: Option<i64>) -> BudgetEvaluation {
    let Some(limit) = limit.filter(|l| *l > 0) else {
        return BudgetEvaluation {
            exceeded: false,
            warning: false,
            percent_used: 0,
        };
    };
    let percent_used = ((used as f64 / limit as f64) * 100.0).round() as i64;
    BudgetEvaluation {
        // used >= 0.8 * limit, in exact integer arithmetic
        warning: used * 5 >= limit * 4,
        exceeded: used >= limit,
        percent_used,
    }
}

/// USD cost for a request against the static catalog, rounded to six decimal
/// places. Unknown models cost zero.
pub fn estimate_cost(model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
    let Some(def) = catalog::model_def(model) else {
        return 0.0;
    };
    let cost = (input_tokens as f64 * def.input_cost_per_million
        + output_tokens as f64 * def.output_cost_per_million)
        / 1_000_000.0;
    (cost * 1_000_000.0).round() / 1_000_000.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub user_id: String,
    pub role: String,
    pub monthly_limit: Option<i64>,
    pub current_usage: i64,
    pub percent_used: i64,
    /// None when the role is unlimited.
    pub remaining: Option<i64>,
    pub reset_date: String,
    pub exceeded: bool,
    pub warning_threshold: bool,
}

impl BudgetStatus {
    fn from_usage(user_id: &str, role: &str, used: i64) -> Self {
        let limit = monthly_budget(role);
        let eval = evaluate_budget(used, limit);
        Self {
            user_id: user_id.to_string(),
            role: role.to_string(),
            monthly_limit: limit,
            current_usage: used,
            percent_used: eval.percent_used,
            remaining: limit.map(|l| (l - used).max(0)),
            reset_date: next_reset_date().to_string(),
            exceeded: eval.exceeded,
            warning_threshold: eval.warning,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordUsage {
    pub user_id: String,
    pub user_email: String,
    pub role: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub request_category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummaryRow {
    pub user_id: String,
    pub role: String,
    pub monthly_limit: Option<i64>,
    pub current_usage: i64,
    pub percent_used: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummary {
    pub period_start: String,
    pub reset_date: String,
    pub total_users: i64,
    pub total_tokens: i64,
    pub users: Vec<BudgetSummaryRow>,
}

#[derive(Clone)]
pub struct BudgetStore {
    db: Db,
}

impl BudgetStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Current-period status for a user. Without a store the counter reads as
    /// zero, which keeps the proxy functional in dev.
    pub async fn get_user_budget(&self, user_id: &str, role: &str) -> Result<BudgetStatus, String> {
        let Some(pool) = self.db.pool() else {
            return Ok(BudgetStatus::from_usage(user_id, role, 0));
        };

        let row = sqlx::query(
            "SELECT role, current_usage FROM user_budgets WHERE user_id = $1 AND period_start = $2",
        )
        .bind(user_id)
        .bind(current_period_start())
        .fetch_optional(pool)
        .await
        .map_err(|e| e.to_string())?;

        // The counter row remembers the role it was accrued under; prefer it
        // so admin views of another user compute against the right limit.
        let (role, used) = match row {
            Some(row) => (
                row.try_get::<String, _>("role").map_err(|e| e.to_string())?,
                row.try_get::<i64, _>("current_usage").map_err(|e| e.to_string())?,
            ),
            None => (role.to_string(), 0),
        };
        Ok(BudgetStatus::from_usage(user_id, &role, used))
    }

    /// Append one ledger row and bump the materialized counter, atomically.
    /// Callers treat this as fire-and-forget; errors are logged upstream.
    pub async fn record_usage(&self, usage: RecordUsage) -> Result<(), String> {
        let Some(mut tx) = self.db.begin().await? else {
            return Ok(());
        };

        let total = usage.input_tokens + usage.output_tokens;
        let cost = estimate_cost(&usage.model, usage.input_tokens, usage.output_tokens);

        sqlx::query(
            r#"INSERT INTO token_usage
                (id, user_id, user_email, model, input_tokens, output_tokens, cost_estimate, request_category)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(Uuid::new_v4())
        .bind(&usage.user_id)
        .bind(&usage.user_email)
        .bind(&usage.model)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(cost)
        .bind(&usage.request_category)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"INSERT INTO user_budgets (user_id, period_start, role, monthly_limit, current_usage, updated_at)
               VALUES ($1, $2, $3, $4, $5, now())
               ON CONFLICT (user_id, period_start)
               DO UPDATE SET current_usage = user_budgets.current_usage + EXCLUDED.current_usage,
                             updated_at = now()"#,
        )
        .bind(&usage.user_id)
        .bind(current_period_start())
        .bind(&usage.role)
        .bind(monthly_budget(&usage.role))
        .bind(total)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;

        tx.commit().await.map_err(|e| e.to_string())
    }

    pub async fn admin_summary(&self) -> Result<BudgetSummary, String> {
        let period_start = current_period_start();
        let reset_date = next_reset_date();

        let Some(pool) = self.db.pool() else {
            return Ok(BudgetSummary {
                period_start: period_start.to_string(),
                reset_date: reset_date.to_string(),
                total_users: 0,
                total_tokens: 0,
                users: Vec::new(),
            });
        };

        let rows = sqlx::query(
            r#"SELECT user_id, role, monthly_limit, current_usage
               FROM user_budgets
               WHERE period_start = $1
               ORDER BY current_usage DESC"#,
        )
        .bind(period_start)
        .fetch_all(pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut users = Vec::with_capacity(rows.len());
        let mut total_tokens = 0i64;
        for row in rows {
            let current_usage: i64 = row.try_get("current_usage").map_err(|e| e.to_string())?;
            let monthly_limit: Option<i64> =
                row.try_get("monthly_limit").map_err(|e| e.to_string())?;
            total_tokens += current_usage;
            users.push(BudgetSummaryRow {
                user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
                role: row.try_get("role").map_err(|e| e.to_string())?,
                monthly_limit,
                current_usage,
                percent_used: evaluate_budget(current_usage, monthly_limit).percent_used,
            });
        }

        Ok(BudgetSummary {
            period_start: period_start.to_string(),
            reset_date: reset_date.to_string(),
            total_users: users.len() as i64,
            total_tokens,
            users,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_limit_means_never_warned_or_exceeded() {
        for limit in [None, Some(0), Some(-5)] {
            let eval = evaluate_budget(1_000_000, limit);
            assert!(!eval.exceeded);
            assert!(!eval.warning);
            assert_eq!(eval.percent_used, 0);
        }
    }

    #[test]
    fn warning_boundary_is_exactly_eighty_percent() {
        let limit = Some(200_000);
        assert!(!evaluate_budget(159_999, limit).warning);
        assert!(evaluate_budget(160_000, limit).warning);
        assert!(!evaluate_budget(160_000, limit).exceeded);
    }

    #[test]
    fn exceeded_at_exactly_the_limit() {
        let eval = evaluate_budget(200_000, Some(200_000));
        assert!(eval.exceeded);
        assert!(eval.warning);
        assert_eq!(eval.percent_used, 100);
    }

    #[test]
    fn evaluation_is_monotone_in_usage() {
        let limit = Some(10_000);
        let mut previous = evaluate_budget(0, limit);
        for used in (0..=12_000).step_by(500) {
            let eval = evaluate_budget(used, limit);
            assert!(eval.warning >= previous.warning);
            assert!(eval.exceeded >= previous.exceeded);
            assert!(eval.percent_used >= previous.percent_used);
            previous = eval;
        }
    }

    #[test]
    fn cost_estimate_uses_catalog_rates() {
        // 1M input at $3 + 1M output at $15.
        let cost = estimate_cost("claude-sonnet-4-20250514", 1_000_000, 1_000_000);
        assert_eq!(cost, 18.0);

        let small = estimate_cost("claude-sonnet-4-20250514", 100, 50);
        assert_eq!(small, 0.00105);

        assert_eq!(estimate_cost("unknown-model", 1000, 1000), 0.0);
    }

    #[test]
    fn unknown_role_inherits_default_budget() {
        assert_eq!(monthly_budget("mystery"), monthly_budget("business"));
        assert_eq!(monthly_budget("admin"), None);
    }

    #[test]
    fn period_boundaries_are_month_firsts() {
        let start = current_period_start();
        assert_eq!(start.day(), 1);
        let reset = next_reset_date();
        assert_eq!(reset.day(), 1);
        assert!(reset > start);
    }

    #[test]
    fn remaining_clamps_at_zero() {
        let status = BudgetStatus::from_usage("u1", "business", 250_000);
        assert_eq!(status.remaining, Some(0));
        assert!(status.exceeded);

        let unlimited = BudgetStatus::from_usage("u2", "admin", 250_000);
        assert_eq!(unlimited.remaining, None);
        assert!(!unlimited.exceeded);
    }
}
