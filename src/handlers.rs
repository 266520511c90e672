//! HTTP surface: the two proxy endpoints (chat-completion translation and
//! native passthrough, each sync + streaming), the budget and admin API-key
//! endpoints, health, models, and metrics.

use crate::app::AppState;
use crate::audit::{self, AuditOutcome, AuditStatus};
use crate::budget::RecordUsage;
use crate::error::{AppError, AppResult};
use crate::keys::ApiKey;
use crate::pipeline::{self, RequestContext};
use crate::upstream::{self, upstream_error_to_app};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Proxy surfaces

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let mut body = body;
    let ctx = match pipeline::run_pipeline(&state, &headers, &mut body, "/v1/chat/completions").await
    {
        Ok(ctx) => ctx,
        Err(err) => {
            spawn_failure_audit(&state, &headers, &body, &err);
            metrics::counter!("dynamo_requests_total", "surface" => "chat", "status" => "rejected")
                .increment(1);
            return Err(err);
        }
    };

    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let upstream_body = chat_request_to_messages(&body, &state.config)
        .map_err(|e| e.with_request_id(&ctx.request_id))?;

    if stream {
        return chat_stream_response(state, ctx, upstream_body).await;
    }

    let upstream_resp = match upstream::call_messages(&state.http, &state.config, &upstream_body)
        .await
    {
        Ok(v) => v,
        Err(err) => {
            let err = upstream_error_to_app(err).with_request_id(&ctx.request_id);
            spawn_error_audit(&state, &ctx, &err);
            return Err(err);
        }
    };

    let (input_tokens, output_tokens) = usage_from_messages_response(&upstream_resp);
    let response_text = joined_text(&upstream_resp);
    let translated = messages_response_to_chat(&upstream_resp, &ctx.resolved_model);

    spawn_usage_and_audit(
        &state,
        &ctx,
        input_tokens,
        output_tokens,
        response_text,
        AuditStatus::Success,
    );
    metrics::counter!("dynamo_requests_total", "surface" => "chat", "status" => "ok").increment(1);

    let mut resp = Json(translated).into_response();
    apply_context_headers(&mut resp, &ctx);
    Ok(resp)
}

pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    let mut body = body;
    let ctx = match pipeline::run_pipeline(&state, &headers, &mut body, "/v1/messages").await {
        Ok(ctx) => ctx,
        Err(err) => {
            spawn_failure_audit(&state, &headers, &body, &err);
            metrics::counter!("dynamo_requests_total", "surface" => "messages", "status" => "rejected")
                .increment(1);
            return Err(err);
        }
    };

    validate_messages_body(&body).map_err(|e| e.with_request_id(&ctx.request_id))?;
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if stream {
        return messages_stream_response(state, ctx, body).await;
    }

    let mut upstream_body = body;
    if let Some(obj) = upstream_body.as_object_mut() {
        obj.remove("stream");
    }

    let upstream_resp = match upstream::call_messages(&state.http, &state.config, &upstream_body)
        .await
    {
        Ok(v) => v,
        Err(err) => {
            let err = upstream_error_to_app(err).with_request_id(&ctx.request_id);
            spawn_error_audit(&state, &ctx, &err);
            return Err(err);
        }
    };

    let (input_tokens, output_tokens) = usage_from_messages_response(&upstream_resp);
    let response_text = joined_text(&upstream_resp);

    spawn_usage_and_audit(
        &state,
        &ctx,
        input_tokens,
        output_tokens,
        response_text,
        AuditStatus::Success,
    );
    metrics::counter!("dynamo_requests_total", "surface" => "messages", "status" => "ok")
        .increment(1);

    let mut resp = Json(upstream_resp).into_response();
    apply_context_headers(&mut resp, &ctx);
    Ok(resp)
}

/// Messages must be a non-empty array; the native surface also requires
/// `max_tokens`.
fn validate_messages_body(body: &Value) -> AppResult<()> {
    let non_empty = body
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if !non_empty {
        return Err(AppError::invalid_request("messages must be a non-empty array"));
    }
    if body.get("max_tokens").and_then(|v| v.as_u64()).is_none() {
        return Err(AppError::invalid_request("max_tokens is required"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Request/response translation (pure functions over data)

/// Translate a chat-completion request into the upstream's native shape.
/// System messages are lifted into the top-level `system` string.
fn chat_request_to_messages(body: &Value, config: &crate::config::Config) -> AppResult<Value> {
    let messages = body
        .get("messages")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| AppError::invalid_request("messages must be a non-empty array"))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut converted: Vec<Value> = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("user");
        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if role == "system" {
            system_parts.push(content);
        } else {
            converted.push(json!({"role": role, "content": content}));
        }
    }
    if converted.is_empty() {
        return Err(AppError::invalid_request(
            "messages must include at least one user or assistant message",
        ));
    }

    let max_tokens = body
        .get("max_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(config.upstream_max_tokens as u64);

    let mut out = json!({
        "model": body.get("model").cloned().unwrap_or_else(|| {
            Value::String(config.upstream_default_model.clone())
        }),
        "max_tokens": max_tokens,
        "messages": converted,
    });
    let obj = out.as_object_mut().expect("literal object");
    if !system_parts.is_empty() {
        obj.insert("system".to_string(), Value::String(system_parts.join("\n")));
    }
    for key in ["temperature", "top_p"] {
        if let Some(v) = body.get(key) {
            obj.insert(key.to_string(), v.clone());
        }
    }
    match body.get("stop") {
        Some(Value::String(s)) => {
            obj.insert("stop_sequences".to_string(), json!([s]));
        }
        Some(Value::Array(a)) => {
            obj.insert("stop_sequences".to_string(), Value::Array(a.clone()));
        }
        _ => {}
    }
    Ok(out)
}

fn map_finish_reason(stop_reason: Option<&str>) -> Value {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => Value::String("stop".to_string()),
        Some("max_tokens") => Value::String("length".to_string()),
        _ => Value::Null,
    }
}

fn joined_text(messages_response: &Value) -> String {
    messages_response
        .get("content")
        .and_then(|v| v.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn usage_from_messages_response(resp: &Value) -> (i64, i64) {
    let usage = resp.get("usage");
    let input = usage
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    (input, output)
}

/// Re-shape an upstream messages response into the chat-completion form.
fn messages_response_to_chat(resp: &Value, model: &str) -> Value {
    let upstream_id = resp.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
    let stop_reason = resp.get("stop_reason").and_then(|v| v.as_str());
    let (input_tokens, output_tokens) = usage_from_messages_response(resp);

    json!({
        "id": format!("chatcmpl-{upstream_id}"),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": joined_text(resp)},
            "finish_reason": map_finish_reason(stop_reason),
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        }
    })
}

// ---------------------------------------------------------------------------
// Streaming

#[derive(Debug, Default)]
struct StreamTotals {
    input_tokens: i64,
    output_tokens: i64,
    text: String,
    corrected_model: Option<String>,
}

async fn chat_stream_response(
    state: AppState,
    ctx: RequestContext,
    mut upstream_body: Value,
) -> AppResult<Response> {
    if let Some(obj) = upstream_body.as_object_mut() {
        obj.insert("stream".to_string(), Value::Bool(true));
    }
    let upstream_resp =
        match upstream::call_messages_stream(&state.http, &state.config, &upstream_body).await {
            Ok(resp) => resp,
            Err(err) => {
                let err = upstream_error_to_app(err).with_request_id(&ctx.request_id);
                spawn_error_audit(&state, &ctx, &err);
                return Err(err);
            }
        };

    let (tx, rx) = mpsc::channel::<Event>(64);
    let state_for_commit = state.clone();
    let ctx_for_commit = ctx.clone();
    tokio::spawn(async move {
        let totals = pump_chat_stream(&ctx_for_commit, upstream_resp, tx).await;
        finalize_stream(&state_for_commit, &ctx_for_commit, totals);
    });

    metrics::counter!("dynamo_requests_total", "surface" => "chat", "status" => "ok").increment(1);
    Ok(sse_response(rx, &ctx))
}

async fn messages_stream_response(
    state: AppState,
    ctx: RequestContext,
    mut body: Value,
) -> AppResult<Response> {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".to_string(), Value::Bool(true));
    }
    let upstream_resp = match upstream::call_messages_stream(&state.http, &state.config, &body)
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            let err = upstream_error_to_app(err).with_request_id(&ctx.request_id);
            spawn_error_audit(&state, &ctx, &err);
            return Err(err);
        }
    };

    let (tx, rx) = mpsc::channel::<Event>(64);
    let state_for_commit = state.clone();
    let ctx_for_commit = ctx.clone();
    tokio::spawn(async move {
        let totals = pump_passthrough_stream(upstream_resp, tx).await;
        finalize_stream(&state_for_commit, &ctx_for_commit, totals);
    });

    metrics::counter!("dynamo_requests_total", "surface" => "messages", "status" => "ok")
        .increment(1);
    Ok(sse_response(rx, &ctx))
}

fn sse_response(rx: mpsc::Receiver<Event>, ctx: &RequestContext) -> Response {
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut resp = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
    resp.headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    apply_context_headers(&mut resp, ctx);
    resp
}

/// Consume the upstream SSE stream, re-emitting chat-completion chunks. A
/// failed send means the client disconnected: return immediately, which
/// drops the upstream stream and aborts further delivery.
async fn pump_chat_stream(
    ctx: &RequestContext,
    upstream_resp: reqwest::Response,
    tx: mpsc::Sender<Event>,
) -> StreamTotals {
    let id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();
    let mut totals = StreamTotals::default();
    let model = ctx.resolved_model.clone();

    let chunk = |delta: Value, finish: Value| {
        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
        })
    };

    if tx
        .send(Event::default().data(chunk(json!({"role": "assistant"}), Value::Null).to_string()))
        .await
        .is_err()
    {
        return totals;
    }

    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { continue };
        let Ok(data) = serde_json::from_str::<Value>(&ev.data) else {
            continue;
        };
        match ev.event.as_str() {
            "message_start" => {
                record_message_start(&data, &mut totals);
            }
            "content_block_delta" => {
                let delta = data.get("delta");
                if delta.and_then(|d| d.get("type")).and_then(|v| v.as_str())
                    == Some("text_delta")
                {
                    let text = delta
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    totals.text.push_str(text);
                    let payload = chunk(json!({"content": text}), Value::Null).to_string();
                    if tx.send(Event::default().data(payload)).await.is_err() {
                        return totals;
                    }
                }
            }
            "message_delta" => {
                record_message_delta(&data, &mut totals);
                let stop_reason = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str());
                let payload = chunk(json!({}), map_finish_reason(stop_reason)).to_string();
                if tx.send(Event::default().data(payload)).await.is_err() {
                    return totals;
                }
            }
            "message_stop" => break,
            _ => {}
        }
    }

    let _ = tx.send(Event::default().data("[DONE]")).await;
    totals
}

/// Native surface: forward upstream events verbatim while accumulating token
/// counts and preview text.
async fn pump_passthrough_stream(
    upstream_resp: reqwest::Response,
    tx: mpsc::Sender<Event>,
) -> StreamTotals {
    let mut totals = StreamTotals::default();
    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let Ok(ev) = ev else { continue };
        if let Ok(data) = serde_json::from_str::<Value>(&ev.data) {
            match ev.event.as_str() {
                "message_start" => record_message_start(&data, &mut totals),
                "message_delta" => record_message_delta(&data, &mut totals),
                "content_block_delta" => {
                    if let Some(text) = data
                        .get("delta")
                        .filter(|d| d.get("type").and_then(|v| v.as_str()) == Some("text_delta"))
                        .and_then(|d| d.get("text"))
                        .and_then(|v| v.as_str())
                    {
                        totals.text.push_str(text);
                    }
                }
                _ => {}
            }
        }
        if tx
            .send(Event::default().event(ev.event).data(ev.data))
            .await
            .is_err()
        {
            return totals;
        }
    }
    totals
}

fn record_message_start(data: &Value, totals: &mut StreamTotals) {
    let message = data.get("message");
    if let Some(input) = message
        .and_then(|m| m.get("usage"))
        .and_then(|u| u.get("input_tokens"))
        .and_then(|v| v.as_i64())
    {
        totals.input_tokens = input;
    }
    if let Some(model) = message.and_then(|m| m.get("model")).and_then(|v| v.as_str()) {
        totals.corrected_model = Some(model.to_string());
    }
}

fn record_message_delta(data: &Value, totals: &mut StreamTotals) {
    if let Some(output) = data
        .get("usage")
        .and_then(|u| u.get("output_tokens"))
        .and_then(|v| v.as_i64())
    {
        totals.output_tokens = output;
    }
}

/// Post-stream commit: runs after the upstream stream finished (tokens are
/// final) and never blocks the client's terminal frame.
fn finalize_stream(state: &AppState, ctx: &RequestContext, totals: StreamTotals) {
    let model = totals
        .corrected_model
        .clone()
        .unwrap_or_else(|| ctx.resolved_model.clone());
    let entry = audit::build_audit_entry(
        &ctx.request_id,
        Some(&ctx.identity.user_id),
        Some(&ctx.identity.user_email),
        &ctx.audit,
        ctx.started_at,
        AuditOutcome {
            model: &model,
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            response_text: &totals.text,
            status: AuditStatus::Success,
        },
    );
    let usage = RecordUsage {
        user_id: ctx.identity.user_id.clone(),
        user_email: ctx.identity.user_email.clone(),
        role: ctx.identity.role.clone(),
        model,
        input_tokens: totals.input_tokens,
        output_tokens: totals.output_tokens,
        request_category: Some(ctx.audit.category.as_str().to_string()),
    };
    spawn_commits(state, usage, entry, totals.input_tokens, totals.output_tokens);
}

// ---------------------------------------------------------------------------
// Post-response commits

fn spawn_usage_and_audit(
    state: &AppState,
    ctx: &RequestContext,
    input_tokens: i64,
    output_tokens: i64,
    response_text: String,
    status: AuditStatus,
) {
    let entry = audit::build_audit_entry(
        &ctx.request_id,
        Some(&ctx.identity.user_id),
        Some(&ctx.identity.user_email),
        &ctx.audit,
        ctx.started_at,
        AuditOutcome {
            model: &ctx.resolved_model,
            input_tokens,
            output_tokens,
            response_text: &response_text,
            status,
        },
    );
    let usage = RecordUsage {
        user_id: ctx.identity.user_id.clone(),
        user_email: ctx.identity.user_email.clone(),
        role: ctx.identity.role.clone(),
        model: ctx.resolved_model.clone(),
        input_tokens,
        output_tokens,
        request_category: Some(ctx.audit.category.as_str().to_string()),
    };
    spawn_commits(state, usage, entry, input_tokens, output_tokens);
}

fn spawn_commits(
    state: &AppState,
    usage: RecordUsage,
    entry: audit::AuditEntry,
    input_tokens: i64,
    output_tokens: i64,
) {
    metrics::counter!("dynamo_tokens_total", "direction" => "input")
        .increment(input_tokens.max(0) as u64);
    metrics::counter!("dynamo_tokens_total", "direction" => "output")
        .increment(output_tokens.max(0) as u64);

    let budgets = state.budgets.clone();
    let audits = state.audits.clone();
    tokio::spawn(async move {
        if let Err(e) = budgets.record_usage(usage).await {
            tracing::warn!("failed to record token usage: {e}");
        }
        if let Err(e) = audits.commit(&entry).await {
            tracing::warn!("failed to commit audit log: {e}");
        }
    });
}

/// Audit entry for an upstream failure after the pipeline completed.
fn spawn_error_audit(state: &AppState, ctx: &RequestContext, err: &AppError) {
    let entry = audit::build_audit_entry(
        &ctx.request_id,
        Some(&ctx.identity.user_id),
        Some(&ctx.identity.user_email),
        &ctx.audit,
        ctx.started_at,
        AuditOutcome {
            model: &ctx.resolved_model,
            input_tokens: 0,
            output_tokens: 0,
            response_text: &err.message,
            status: AuditStatus::Error,
        },
    );
    let audits = state.audits.clone();
    tokio::spawn(async move {
        if let Err(e) = audits.commit(&entry).await {
            tracing::warn!("failed to commit audit log: {e}");
        }
    });
}

/// Best-effort audit for requests rejected by a pipeline stage (the audit
/// context was never populated, so derive it here).
fn spawn_failure_audit(state: &AppState, headers: &HeaderMap, body: &Value, err: &AppError) {
    let request_id = err
        .request_id
        .clone()
        .unwrap_or_else(|| pipeline::request_id_from_headers(headers));
    let prompt_text = audit::extract_prompt_text(body);
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let source = audit::detect_source(user_agent);
    let status = if err.code == "sensitive_data_blocked" {
        AuditStatus::Blocked
    } else {
        AuditStatus::Error
    };
    let audit_ctx = audit::AuditContext {
        prompt_hash: audit::hash_prompt(&prompt_text),
        prompt_preview: audit::extract_preview(&prompt_text, audit::PREVIEW_MAX_LEN),
        source,
        category: crate::classifier::classify(&prompt_text, source).category,
        prompt_text,
    };
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.upstream_default_model)
        .to_string();
    let entry = audit::build_audit_entry(
        &request_id,
        None,
        None,
        &audit_ctx,
        std::time::Instant::now(),
        AuditOutcome {
            model: &model,
            input_tokens: 0,
            output_tokens: 0,
            response_text: &err.message,
            status,
        },
    );
    let audits = state.audits.clone();
    tokio::spawn(async move {
        if let Err(e) = audits.commit(&entry).await {
            tracing::warn!("failed to commit audit log: {e}");
        }
    });
}

fn apply_context_headers(resp: &mut Response, ctx: &RequestContext) {
    let headers = resp.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert("x-request-id", value);
    }
    if ctx.downgraded {
        headers.insert("x-model-downgraded", HeaderValue::from_static("true"));
    }
    if let Some(warning) = &ctx.budget_warning {
        if let Ok(value) = HeaderValue::from_str(warning) {
            headers.insert("x-budget-warning", value);
        }
    }
    if let Some(warning) = &ctx.sensitive_warning {
        if let Ok(value) = HeaderValue::from_str(warning) {
            headers.insert("x-sensitive-data-warning", value);
        }
    }
}

// ---------------------------------------------------------------------------
// Budget surface

pub async fn get_budget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    let identity = state
        .auth
        .authenticate(&headers, &state.keys, &state.profiles)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;

    if identity.user_id != user_id && !identity.is_admin() {
        return Err(AppError::forbidden("you can only view your own budget")
            .with_request_id(&request_id));
    }

    let role = if identity.user_id == user_id {
        identity.role.clone()
    } else {
        crate::catalog::DEFAULT_ROLE.to_string()
    };
    let status = state
        .budgets
        .get_user_budget(&user_id, &role)
        .await
        .map_err(|e| AppError::internal(e).with_request_id(&request_id))?;
    Ok(Json(status).into_response())
}

pub async fn admin_budget_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    require_admin(&state, &headers, &request_id).await?;
    let summary = state
        .budgets
        .admin_summary()
        .await
        .map_err(|e| AppError::internal(e).with_request_id(&request_id))?;
    Ok(Json(summary).into_response())
}

// ---------------------------------------------------------------------------
// Admin API-key surface

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub email: String,
    pub role: Option<String>,
}

fn api_key_json(key: &ApiKey) -> Value {
    json!({
        "id": key.id,
        "userId": key.user_id,
        "userEmail": key.user_email,
        "keyPrefix": key.key_prefix,
        "role": key.role,
        "createdAt": key.created_at.to_rfc3339(),
        "lastUsedAt": key.last_used_at.map(|t| t.to_rfc3339()),
        "revokedAt": key.revoked_at.map(|t| t.to_rfc3339()),
        "isActive": key.is_active,
    })
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateApiKeyRequest>,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    require_admin(&state, &headers, &request_id).await?;

    if !body.email.contains('@') {
        return Err(AppError::invalid_request("email is required").with_request_id(&request_id));
    }
    let role = body.role.as_deref().unwrap_or(crate::catalog::DEFAULT_ROLE);
    if !crate::catalog::is_known_role(role) {
        return Err(AppError::invalid_request(format!("unknown role {role:?}"))
            .with_request_id(&request_id));
    }

    let (key, raw) = state
        .keys
        .create(&body.email, role)
        .await
        .map_err(|e| store_unavailable(e).with_request_id(&request_id))?;

    let mut out = api_key_json(&key);
    // The raw key appears here and nowhere else.
    out.as_object_mut()
        .expect("literal object")
        .insert("apiKey".to_string(), Value::String(raw));
    Ok((StatusCode::CREATED, Json(out)).into_response())
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    require_admin(&state, &headers, &request_id).await?;
    let keys = state
        .keys
        .list()
        .await
        .map_err(|e| store_unavailable(e).with_request_id(&request_id))?;
    let data: Vec<Value> = keys.iter().map(api_key_json).collect();
    Ok(Json(json!({"keys": data})).into_response())
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    require_admin(&state, &headers, &request_id).await?;
    let revoked = state
        .keys
        .revoke(id)
        .await
        .map_err(|e| store_unavailable(e).with_request_id(&request_id))?;
    Ok(Json(json!({"revoked": revoked})).into_response())
}

pub async fn rotate_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    require_admin(&state, &headers, &request_id).await?;
    let rotated = state
        .keys
        .rotate(id)
        .await
        .map_err(|e| store_unavailable(e).with_request_id(&request_id))?;
    let Some((key, raw)) = rotated else {
        return Err(AppError::not_found("no active key with that id").with_request_id(&request_id));
    };
    let mut out = api_key_json(&key);
    out.as_object_mut()
        .expect("literal object")
        .insert("apiKey".to_string(), Value::String(raw));
    Ok(Json(out).into_response())
}

async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> AppResult<crate::auth::Identity> {
    let identity = state
        .auth
        .authenticate(headers, &state.keys, &state.profiles)
        .await
        .map_err(|e| e.with_request_id(request_id))?;
    if !identity.is_admin() {
        return Err(AppError::forbidden("admin role required").with_request_id(request_id));
    }
    Ok(identity)
}

fn store_unavailable(message: String) -> AppError {
    AppError::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", message)
}

// ---------------------------------------------------------------------------
// Models, health, metrics

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let request_id = pipeline::request_id_from_headers(&headers);
    let identity = state
        .auth
        .authenticate(&headers, &state.keys, &state.profiles)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;

    let permitted = crate::catalog::role_def(&identity.role).permitted_models;
    let data: Vec<Value> = crate::catalog::MODELS
        .iter()
        .filter(|m| identity.is_admin() || permitted.contains(&m.id))
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "display_name": m.display_name,
                "tier": m.tier,
            })
        })
        .collect();
    Ok(Json(json!({"object": "list", "data": data})).into_response())
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("end_turn")), json!("stop"));
        assert_eq!(map_finish_reason(Some("stop_sequence")), json!("stop"));
        assert_eq!(map_finish_reason(Some("max_tokens")), json!("length"));
        assert_eq!(map_finish_reason(Some("tool_use")), Value::Null);
        assert_eq!(map_finish_reason(None), Value::Null);
    }

    #[test]
    fn messages_response_reshapes_to_chat_completion() {
        let upstream = json!({
            "id": "msg_01ABC",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                {"type": "text", "text": " world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let chat = messages_response_to_chat(&upstream, "claude-sonnet-4-20250514");
        assert_eq!(chat["id"], json!("chatcmpl-msg_01ABC"));
        assert_eq!(chat["object"], json!("chat.completion"));
        assert_eq!(chat["choices"][0]["message"]["content"], json!("Hello world"));
        assert_eq!(chat["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(chat["usage"]["prompt_tokens"], json!(12));
        assert_eq!(chat["usage"]["completion_tokens"], json!(7));
        assert_eq!(chat["usage"]["total_tokens"], json!(19));
    }

    #[test]
    fn chat_request_translation_lifts_system_and_maps_stop() {
        let config = crate::config::Config::for_tests();
        let body = json!({
            "model": "claude-sonnet-4-20250514",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hello"}
            ],
            "temperature": 0.2,
            "stop": "END"
        });
        let out = chat_request_to_messages(&body, &config).unwrap();
        assert_eq!(out["system"], json!("be brief"));
        assert_eq!(out["messages"], json!([{"role": "user", "content": "hello"}]));
        assert_eq!(out["max_tokens"], json!(4096));
        assert_eq!(out["temperature"], json!(0.2));
        assert_eq!(out["stop_sequences"], json!(["END"]));
        assert!(out.get("stream").is_none());
    }

    #[test]
    fn chat_request_requires_messages() {
        let config = crate::config::Config::for_tests();
        assert!(chat_request_to_messages(&json!({"messages": []}), &config).is_err());
        assert!(chat_request_to_messages(
            &json!({"messages": [{"role": "system", "content": "only system"}]}),
            &config
        )
        .is_err());
    }

    #[test]
    fn native_body_validation() {
        assert!(validate_messages_body(&json!({
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 100
        }))
        .is_ok());
        assert!(validate_messages_body(&json!({"messages": [], "max_tokens": 100})).is_err());
        assert!(validate_messages_body(&json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .is_err());
    }

    #[test]
    fn stream_event_accounting() {
        let mut totals = StreamTotals::default();
        record_message_start(
            &json!({"message": {"model": "claude-opus-4-20250514", "usage": {"input_tokens": 33}}}),
            &mut totals,
        );
        record_message_delta(&json!({"usage": {"output_tokens": 21}}), &mut totals);
        assert_eq!(totals.input_tokens, 33);
        assert_eq!(totals.output_tokens, 21);
        assert_eq!(totals.corrected_model.as_deref(), Some("claude-opus-4-20250514"));
    }
}
