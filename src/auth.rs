//! Authentication stage: resolves identity and role from an API key, a
//! signed bearer token, or (in mock mode) caller-asserted headers.

use crate::catalog;
use crate::config::{AuthMode, Config};
use crate::error::{AppError, AppResult};
use crate::keys::{self, ApiKeyStore};
use crate::users::{UpsertProfile, UserProfileStore};
use axum::http::{HeaderMap, StatusCode};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ApiKey,
    Bearer,
    Mock,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Bearer => "bearer",
            Self::Mock => "mock",
        }
    }
}

/// Identity resolved by the authentication stage; the rest of the pipeline
/// reads role and user fields from here.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub user_email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub api_key_id: Option<Uuid>,
    pub auth_method: AuthMethod,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

enum TokenKind<'a> {
    ApiKey(&'a str),
    Jwt(&'a str),
    Unknown,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn detect_token(token: &str) -> TokenKind<'_> {
    if token.starts_with("dynamo-sk-") {
        TokenKind::ApiKey(token)
    } else if token.starts_with("eyJ") {
        TokenKind::Jwt(token)
    } else {
        TokenKind::Unknown
    }
}

#[derive(Debug, Deserialize)]
struct BearerClaims {
    sub: Option<String>,
    id: Option<String>,
    email: Option<String>,
    #[serde(alias = "displayName")]
    name: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    role: Option<String>,
    department: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// Directory groups map to roles by fixed priority; the first marker present
/// anywhere in the group list wins. No groups → default role.
const GROUP_ROLE_PRIORITY: &[(&str, &str)] = &[
    ("admin", "admin"),
    ("engineer", "engineer"),
    ("power", "power_user"),
    ("business", "business"),
];

pub fn role_from_groups(groups: &[String]) -> Option<&'static str> {
    for &(marker, role) in GROUP_ROLE_PRIORITY {
        if groups
            .iter()
            .any(|g| g.to_ascii_lowercase().contains(marker))
        {
            return Some(role);
        }
    }
    None
}

#[derive(Clone)]
pub struct AuthState {
    mode: AuthMode,
    jwt_secret: Option<String>,
}

impl AuthState {
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.auth_mode,
            jwt_secret: config.jwt_secret.clone(),
        }
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        keys: &ApiKeyStore,
        profiles: &UserProfileStore,
    ) -> AppResult<Identity> {
        let token = bearer_token(headers);

        // API keys are honored in both modes; mock headers only apply when no
        // recognizable credential was presented.
        if let Some(token) = token {
            match detect_token(token) {
                TokenKind::ApiKey(raw) => return self.authenticate_api_key(raw, keys).await,
                TokenKind::Jwt(raw) if self.mode == AuthMode::Token => {
                    return self.authenticate_bearer(raw, profiles).await;
                }
                _ => {}
            }
        }

        match self.mode {
            AuthMode::Mock => Ok(mock_identity(headers)),
            AuthMode::Token => Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "auth_required",
                "missing or unrecognized credentials",
            )),
        }
    }

    async fn authenticate_api_key(&self, raw: &str, keys: &ApiKeyStore) -> AppResult<Identity> {
        if !keys::is_valid_key_format(raw) {
            return Err(invalid_api_key());
        }
        let key = keys
            .lookup_by_hash(&keys::hash_key(raw))
            .await
            .map_err(|_| invalid_api_key())?
            .ok_or_else(invalid_api_key)?;

        Ok(Identity {
            user_id: key.user_id,
            user_email: key.user_email,
            display_name: None,
            role: key.role,
            api_key_id: Some(key.id),
            auth_method: AuthMethod::ApiKey,
        })
    }

    async fn authenticate_bearer(
        &self,
        raw: &str,
        profiles: &UserProfileStore,
    ) -> AppResult<Identity> {
        let secret = self.jwt_secret.as_deref().ok_or_else(invalid_token)?;
        let claims = decode_bearer(raw, secret)?;

        let user_id = claims
            .sub
            .clone()
            .or_else(|| claims.id.clone())
            .or_else(|| claims.email.clone())
            .ok_or_else(invalid_token)?;
        let user_email = claims.email.clone().unwrap_or_else(|| user_id.clone());

        let role = if !claims.groups.is_empty() {
            role_from_groups(&claims.groups)
                .unwrap_or(catalog::DEFAULT_ROLE)
                .to_string()
        } else {
            claims
                .role
                .as_deref()
                .filter(|r| catalog::is_known_role(r))
                .unwrap_or(catalog::DEFAULT_ROLE)
                .to_string()
        };

        let identity = Identity {
            user_id,
            user_email,
            display_name: claims.name.clone(),
            role,
            api_key_id: None,
            auth_method: AuthMethod::Bearer,
        };

        let profile = UpsertProfile {
            user_id: identity.user_id.clone(),
            email: identity.user_email.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role.clone(),
            department: claims.department,
            identity_groups: claims.groups,
        };
        let profiles = profiles.clone();
        tokio::spawn(async move {
            if let Err(e) = profiles.upsert(profile).await {
                tracing::warn!("failed to upsert user profile: {e}");
            }
        });

        Ok(identity)
    }
}

fn decode_bearer(raw: &str, secret: &str) -> AppResult<BearerClaims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    jsonwebtoken::decode::<BearerClaims>(
        raw,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| invalid_token())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

/// Test/dev identity from caller-asserted headers.
fn mock_identity(headers: &HeaderMap) -> Identity {
    let email = header_str(headers, "x-mock-user-email")
        .or_else(|| header_str(headers, "x-user-email"))
        .unwrap_or("test@dynamo.works")
        .to_string();
    let role = header_str(headers, "x-mock-user-role")
        .or_else(|| header_str(headers, "x-user-role"))
        .filter(|r| catalog::is_known_role(r))
        .unwrap_or(catalog::DEFAULT_ROLE)
        .to_string();
    let user_id = header_str(headers, "x-user-id")
        .map(str::to_string)
        .unwrap_or_else(|| email.clone());

    Identity {
        user_id,
        user_email: email,
        display_name: None,
        role,
        api_key_id: None,
        auth_method: AuthMethod::Mock,
    }
}

fn invalid_api_key() -> AppError {
    AppError::new(
        StatusCode::UNAUTHORIZED,
        "invalid_api_key",
        "invalid or revoked API key",
    )
}

fn invalid_token() -> AppError {
    AppError::new(
        StatusCode::UNAUTHORIZED,
        "invalid_token",
        "bearer token could not be verified",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> u64 {
        (chrono::Utc::now().timestamp() as u64) + 3600
    }

    #[test]
    fn group_priority_first_match_wins() {
        let groups = vec!["Dynamo-BusinessUsers".to_string(), "Dynamo-Admins".to_string()];
        assert_eq!(role_from_groups(&groups), Some("admin"));

        let groups = vec!["Dynamo-PowerUsers".to_string()];
        assert_eq!(role_from_groups(&groups), Some("power_user"));

        assert_eq!(role_from_groups(&[]), None);
        assert_eq!(role_from_groups(&["Interns".to_string()]), None);
    }

    #[test]
    fn decode_accepts_valid_and_rejects_tampered() {
        let secret = "unit-secret";
        let token = sign(
            &json!({"sub": "alice", "email": "alice@dynamo.works", "exp": future_exp()}),
            secret,
        );
        let claims = decode_bearer(&token, secret).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("alice"));

        assert!(decode_bearer(&token, "other-secret").is_err());

        let expired = sign(&json!({"sub": "alice", "exp": 1000}), secret);
        assert!(decode_bearer(&expired, secret).is_err());
    }

    #[test]
    fn subject_fallback_order_is_sub_id_email() {
        let secret = "unit-secret";
        for (claims, expected) in [
            (json!({"sub": "s", "id": "i", "email": "e@x.co", "exp": future_exp()}), "s"),
            (json!({"id": "i", "email": "e@x.co", "exp": future_exp()}), "i"),
            (json!({"email": "e@x.co", "exp": future_exp()}), "e@x.co"),
        ] {
            let decoded = decode_bearer(&sign(&claims, secret), secret).unwrap();
            let user_id = decoded
                .sub
                .or(decoded.id)
                .or(decoded.email)
                .expect("subject resolvable");
            assert_eq!(user_id, expected);
        }
    }

    #[test]
    fn mock_identity_prefers_mock_headers_then_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert("x-mock-user-email", "bob@dynamo.works".parse().unwrap());
        headers.insert("x-mock-user-role", "engineer".parse().unwrap());
        let identity = mock_identity(&headers);
        assert_eq!(identity.user_email, "bob@dynamo.works");
        assert_eq!(identity.role, "engineer");
        assert_eq!(identity.auth_method, AuthMethod::Mock);

        let identity = mock_identity(&HeaderMap::new());
        assert_eq!(identity.user_email, "test@dynamo.works");
        assert_eq!(identity.role, catalog::DEFAULT_ROLE);
    }

    #[test]
    fn unknown_mock_role_falls_back_to_default() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-role", "superuser".parse().unwrap());
        assert_eq!(mock_identity(&headers).role, catalog::DEFAULT_ROLE);
    }
}
