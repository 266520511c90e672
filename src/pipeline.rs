//! The staged request pipeline: authentication → sensitive-data scan →
//! budget enforcement → model routing → audit preparation. Stages run
//! strictly in order; each one mutates the per-request context the next
//! consumes, and any failure short-circuits to the handler.

use crate::alerts::{build_alert, AlertContext};
use crate::app::AppState;
use crate::audit::{self, AuditContext};
use crate::auth::Identity;
use crate::catalog;
use crate::classifier;
use crate::config::BudgetEnforcement;
use crate::error::{AppError, AppResult};
use crate::routing;
use crate::scanner::{self, Severity};
use axum::http::{HeaderMap, StatusCode};
use serde_json::Value;

/// Per-request state, created at ingress and dropped when the response
/// closes. Never shared across requests.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started_at: std::time::Instant,
    pub identity: Identity,
    pub audit: AuditContext,
    pub resolved_model: String,
    pub downgraded: bool,
    pub budget_warning: Option<String>,
    pub sensitive_warning: Option<String>,
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Run every pre-upstream stage against `body`, which is mutated in place
/// (model rewrite, max_tokens clamp).
pub async fn run_pipeline(
    state: &AppState,
    headers: &HeaderMap,
    body: &mut Value,
    route: &str,
) -> AppResult<RequestContext> {
    let request_id = request_id_from_headers(headers);
    let started_at = std::time::Instant::now();

    let identity = state
        .auth
        .authenticate(headers, &state.keys, &state.profiles)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;

    let prompt_text = audit::extract_prompt_text(body);

    let sensitive_warning = scan_stage(state, &request_id, &identity, &prompt_text, route)?;
    let budget_warning = budget_stage(state, &request_id, &identity).await?;
    let (resolved_model, downgraded) = routing_stage(state, &identity, body);
    let audit = audit_stage(headers, prompt_text);

    Ok(RequestContext {
        request_id,
        started_at,
        identity,
        audit,
        resolved_model,
        downgraded,
        budget_warning,
        sensitive_warning,
    })
}

/// Scan the prompt. High severity blocks the request (after firing an
/// alert); medium severity warns and proceeds.
fn scan_stage(
    state: &AppState,
    request_id: &str,
    identity: &Identity,
    prompt_text: &str,
    route: &str,
) -> AppResult<Option<String>> {
    let result = scanner::scan_text(prompt_text);
    if result.findings.is_empty() {
        return Ok(None);
    }

    let context = AlertContext {
        request_id: request_id.to_string(),
        user_id: Some(identity.user_id.clone()),
        user_email: Some(identity.user_email.clone()),
        route: route.to_string(),
    };
    state.alerts.publish(build_alert(context, &result.findings));

    if result.has_high_severity {
        metrics::counter!("dynamo_sensitive_blocks_total").increment(1);
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "sensitive_data_blocked",
            scanner::block_message(&result.findings),
        )
        .with_request_id(request_id));
    }

    let labels: Vec<&str> = {
        let mut seen = Vec::new();
        for f in &result.findings {
            if f.severity == Severity::Medium && !seen.contains(&f.finding_type.label()) {
                seen.push(f.finding_type.label());
            }
        }
        seen
    };
    Ok(Some(format!(
        "Possible sensitive data detected: {}",
        labels.join(", ")
    )))
}

/// Enforce the monthly budget. Admins, `none` mode, and store-less deploys
/// skip; store read failures log and proceed so a dependency fault never
/// blocks traffic.
async fn budget_stage(
    state: &AppState,
    request_id: &str,
    identity: &Identity,
) -> AppResult<Option<String>> {
    if identity.is_admin()
        || state.config.budget_enforcement == BudgetEnforcement::None
        || !state.db.is_enabled()
    {
        return Ok(None);
    }

    let status = match state
        .budgets
        .get_user_budget(&identity.user_id, &identity.role)
        .await
    {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("budget read failed, proceeding unenforced: {e}");
            return Ok(None);
        }
    };

    if status.exceeded {
        let detail = format!(
            "Monthly token budget exceeded: {} of {} tokens used. Budget resets on {}.",
            status.current_usage,
            status.monthly_limit.unwrap_or(0),
            status.reset_date
        );
        if state.config.budget_enforcement == BudgetEnforcement::Hard {
            metrics::counter!("dynamo_budget_blocks_total").increment(1);
            return Err(AppError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "budget_exceeded",
                detail,
            )
            .with_request_id(request_id));
        }
        return Ok(Some(detail));
    }

    if status.warning_threshold {
        return Ok(Some(format!(
            "Usage at {}% of monthly limit",
            status.percent_used
        )));
    }
    Ok(None)
}

/// Rewrite the requested model to a permitted one and clamp `max_tokens` to
/// the role's per-request cap.
fn routing_stage(state: &AppState, identity: &Identity, body: &mut Value) -> (String, bool) {
    let requested = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.upstream_default_model)
        .to_string();

    let resolution = routing::resolve_model(&requested, &identity.role);
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "model".to_string(),
            Value::String(resolution.resolved_model.clone()),
        );

        if let Some(cap) = catalog::role_def(resolution.effective_role).max_tokens_per_request {
            if let Some(requested_max) = obj.get("max_tokens").and_then(|v| v.as_u64()) {
                if requested_max > cap as u64 {
                    obj.insert("max_tokens".to_string(), Value::Number(cap.into()));
                }
            }
        }
    }

    (resolution.resolved_model, resolution.downgraded)
}

/// Populate the audit context: hash, preview, source, category. Writes
/// nothing; the post-response commit consumes this.
fn audit_stage(headers: &HeaderMap, prompt_text: String) -> AuditContext {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let source = audit::detect_source(user_agent);
    let classification = classifier::classify(&prompt_text, source);

    AuditContext {
        prompt_hash: audit::hash_prompt(&prompt_text),
        prompt_preview: audit::extract_preview(&prompt_text, audit::PREVIEW_MAX_LEN),
        source,
        category: classification.category,
        prompt_text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_prefers_inbound_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "req-abc".parse().unwrap());
        assert_eq!(request_id_from_headers(&headers), "req-abc");

        let generated = request_id_from_headers(&HeaderMap::new());
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn audit_stage_derives_source_and_category() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::USER_AGENT, "curl/8.4.0".parse().unwrap());
        let audit = audit_stage(&headers, "help me with this task".to_string());
        assert_eq!(audit.source, audit::Source::Cli);
        assert_eq!(audit.category, classifier::Category::CodeGeneration);
        assert_eq!(audit.prompt_hash.len(), 64);
    }
}
