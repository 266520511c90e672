//! Fire-and-forget publication of security findings to an external
//! notification topic. Without a configured destination, alerts are logged.

use crate::scanner::{Finding, Severity};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertContext {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    pub route: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertFinding {
    #[serde(rename = "type")]
    pub finding_type: String,
    pub severity: String,
    pub redacted_value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: String,
    pub timestamp: String,
    pub context: AlertContext,
    pub findings: Vec<AlertFinding>,
}

pub fn build_alert(context: AlertContext, findings: &[Finding]) -> SecurityAlert {
    let severity = if findings.iter().any(|f| f.severity == Severity::High) {
        "high"
    } else {
        "medium"
    };
    SecurityAlert {
        alert_type: "sensitive_data_detected".to_string(),
        severity: severity.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        context,
        findings: findings
            .iter()
            .map(|f| AlertFinding {
                finding_type: f.finding_type.label().to_string(),
                severity: match f.severity {
                    Severity::High => "high".to_string(),
                    Severity::Medium => "medium".to_string(),
                },
                redacted_value: f.redacted_value.clone(),
            })
            .collect(),
    }
}

#[derive(Clone)]
pub struct AlertPublisher {
    http: reqwest::Client,
    topic_url: Option<String>,
}

impl AlertPublisher {
    pub fn new(http: reqwest::Client, topic_url: Option<String>) -> Self {
        Self { http, topic_url }
    }

    /// Publish without blocking the request; failures log and are swallowed.
    pub fn publish(&self, alert: SecurityAlert) {
        let Some(url) = self.topic_url.clone() else {
            tracing::warn!(
                severity = %alert.severity,
                request_id = %alert.context.request_id,
                findings = alert.findings.len(),
                "security alert (no topic configured)"
            );
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http.post(&url).json(&alert).send().await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::warn!("alert publish returned status {}", resp.status());
                }
                Err(e) => tracing::warn!("alert publish failed: {e}"),
                _ => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::FindingType;

    fn finding(severity: Severity) -> Finding {
        Finding {
            finding_type: FindingType::AwsAccessKey,
            severity,
            redacted_value: "AKIA****".to_string(),
            index: 0,
        }
    }

    #[test]
    fn alert_severity_is_high_when_any_finding_is_high() {
        let context = AlertContext {
            request_id: "req-1".to_string(),
            user_id: None,
            user_email: None,
            route: "/v1/messages".to_string(),
        };
        let alert = build_alert(context.clone(), &[finding(Severity::Medium), finding(Severity::High)]);
        assert_eq!(alert.severity, "high");

        let alert = build_alert(context, &[finding(Severity::Medium)]);
        assert_eq!(alert.severity, "medium");
    }

    #[test]
    fn alert_carries_labels_not_values() {
        let context = AlertContext {
            request_id: "req-2".to_string(),
            user_id: Some("alice".to_string()),
            user_email: None,
            route: "/v1/chat/completions".to_string(),
        };
        let alert = build_alert(context, &[finding(Severity::High)]);
        assert_eq!(alert.findings[0].finding_type, "AWS Access Key");
        assert_eq!(alert.findings[0].redacted_value, "AKIA****");
    }
}
