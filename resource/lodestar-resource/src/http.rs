//! External-service resource manager.
//!
//! Confirm and cancel are plain HTTP POSTs against paths the remote service
//! exposes, with the transaction identity in both headers and a JSON body.
//! The HTTP status code is mapped onto the communication-result taxonomy so
//! the retry driver can tell a flapping service (5xx, 404, 408) from one
//! that has firmly said no (401/403, 409, other 4xx).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use lodestar_core::model::{BranchTransaction, CommunicationResult};

use crate::dispatch::{PhaseTwoOp, ResourceHandler};
use crate::resolver::ServiceAddressResolver;

pub const HEADER_XID: &str = "X-Transaction-ID";
pub const HEADER_BRANCH_ID: &str = "X-Branch-ID";
pub const HEADER_SERVICE_GROUP: &str = "X-Service-Group";
pub const HEADER_API_KEY: &str = "X-API-Key";

/// Authentication for the external service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum AuthConfig {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
    ApiKey {
        key: String,
    },
}

/// Per-service HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalServiceConfig {
    pub confirm_path: String,
    pub cancel_path: String,
    pub health_path: String,
    pub request_timeout_ms: u64,
    pub service_group: String,
    pub auth: AuthConfig,
    pub custom_headers: HashMap<String, String>,
    pub custom_parameters: Option<Value>,
}

impl Default for ExternalServiceConfig {
    fn default() -> Self {
        Self {
            confirm_path: "/transaction/confirm".into(),
            cancel_path: "/transaction/cancel".into(),
            health_path: "/health".into(),
            request_timeout_ms: 3_000,
            service_group: "default".into(),
            auth: AuthConfig::None,
            custom_headers: HashMap::new(),
            custom_parameters: None,
        }
    }
}

/// JSON body of a confirm/cancel request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub xid: String,
    pub branch_id: i64,
    pub operation: String,
    pub timestamp: i64,
    pub service_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// HTTP client for confirm/cancel against an external service.
pub struct ExternalServiceClient {
    http: reqwest::Client,
    resolver: Arc<dyn ServiceAddressResolver>,
    config: ExternalServiceConfig,
}

impl ExternalServiceClient {
    pub fn new(resolver: Arc<dyn ServiceAddressResolver>, config: ExternalServiceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { http, resolver, config }
    }

    pub async fn confirm(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.execute_operation(branch, PhaseTwoOp::Commit).await
    }

    pub async fn cancel(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.execute_operation(branch, PhaseTwoOp::Rollback).await
    }

    async fn execute_operation(&self, branch: &BranchTransaction, op: PhaseTwoOp) -> CommunicationResult {
        let operation = match op {
            PhaseTwoOp::Commit => "confirm",
            PhaseTwoOp::Rollback => "cancel",
        };

        let base_url = match self.resolver.resolve(&branch.resource_id).await {
            Ok(url) => url,
            Err(err) => return CommunicationResult::resource_error(err.to_string()),
        };
        let path = match op {
            PhaseTwoOp::Commit => &self.config.confirm_path,
            PhaseTwoOp::Rollback => &self.config.cancel_path,
        };
        let url = join_url(&base_url, path);

        let body = TransactionRequest {
            xid: branch.xid.clone(),
            branch_id: branch.branch_id,
            operation: operation.to_string(),
            timestamp: lodestar_core::model::now_millis(),
            service_group: self.config.service_group.clone(),
            parameters: self.config.custom_parameters.clone(),
        };

        let started = Instant::now();
        let request = self
            .http
            .post(&url)
            .headers(self.build_headers(branch))
            .json(&body);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %url, operation, status = status.as_u16(), "external service responded");
                map_status(status, operation)
                    .with_target(url)
                    .with_duration_ms(started.elapsed().as_millis() as u64)
            }
            Err(err) => {
                warn!(url = %url, operation, error = %err, "external service request failed");
                if err.is_timeout() {
                    CommunicationResult::timeout(format!("{operation} timed out: {err}")).with_target(url)
                } else if err.is_connect() {
                    CommunicationResult::network_error(format!("{operation} connect failed: {err}")).with_target(url)
                } else {
                    CommunicationResult::network_error(format!("{operation} failed: {err}")).with_target(url)
                }
            }
        }
    }

    fn build_headers(&self, branch: &BranchTransaction) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, HEADER_XID, &branch.xid);
        insert_header(&mut headers, HEADER_BRANCH_ID, &branch.branch_id.to_string());
        insert_header(&mut headers, HEADER_SERVICE_GROUP, &self.config.service_group);

        match &self.config.auth {
            AuthConfig::None => {}
            AuthConfig::Basic { username, password } => {
                let credentials = format!("{username}:{password}");
                insert_header(
                    &mut headers,
                    "Authorization",
                    &format!("Basic {}", STANDARD.encode(credentials.as_bytes())),
                );
            }
            AuthConfig::Bearer { token } => {
                insert_header(&mut headers, "Authorization", &format!("Bearer {token}"));
            }
            AuthConfig::ApiKey { key } => {
                insert_header(&mut headers, HEADER_API_KEY, key);
            }
        }

        for (name, value) in &self.config.custom_headers {
            insert_header(&mut headers, name, value);
        }
        headers
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Map an HTTP status onto the communication-result taxonomy.
pub fn map_status(status: StatusCode, operation: &str) -> CommunicationResult {
    match status.as_u16() {
        200..=299 => CommunicationResult::success(),
        401 | 403 => CommunicationResult::auth_error(format!("{operation} rejected: {status}")),
        404 => CommunicationResult::resource_error(format!("{operation} endpoint not found")),
        408 | 504 => CommunicationResult::timeout(format!("{operation} timed out: {status}")),
        // Duplicate request; the first one already settled the branch.
        409 => CommunicationResult::failure(format!("{operation} conflict (duplicate)")),
        400..=499 => CommunicationResult::non_retryable_error(format!("{operation} failed: {status}")),
        500..=599 => CommunicationResult::retryable_error(format!("{operation} failed: {status}")),
        _ => CommunicationResult::failure(format!("{operation} unexpected status: {status}")),
    }
}

#[async_trait]
impl ResourceHandler for ExternalServiceClient {
    async fn branch_commit(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.confirm(branch).await
    }

    async fn branch_rollback(&self, branch: &BranchTransaction) -> CommunicationResult {
        self.cancel(branch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestar_core::model::CommStatus;

    #[test]
    fn status_mapping_follows_the_table() {
        assert_eq!(map_status(StatusCode::OK, "confirm").status, CommStatus::Success);
        assert_eq!(map_status(StatusCode::NO_CONTENT, "confirm").status, CommStatus::Success);
        assert_eq!(map_status(StatusCode::UNAUTHORIZED, "confirm").status, CommStatus::AuthError);
        assert_eq!(map_status(StatusCode::FORBIDDEN, "confirm").status, CommStatus::AuthError);
        assert_eq!(map_status(StatusCode::NOT_FOUND, "confirm").status, CommStatus::ResourceError);
        assert_eq!(map_status(StatusCode::REQUEST_TIMEOUT, "confirm").status, CommStatus::Timeout);
        assert_eq!(map_status(StatusCode::GATEWAY_TIMEOUT, "confirm").status, CommStatus::Timeout);
        assert_eq!(map_status(StatusCode::CONFLICT, "confirm").status, CommStatus::Failure);
        assert_eq!(
            map_status(StatusCode::UNPROCESSABLE_ENTITY, "confirm").status,
            CommStatus::NonRetryableError
        );
        assert_eq!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, "confirm").status,
            CommStatus::RetryableError
        );
        assert_eq!(
            map_status(StatusCode::INTERNAL_SERVER_ERROR, "confirm").status,
            CommStatus::RetryableError
        );
    }

    #[test]
    fn retryability_of_mapped_statuses() {
        assert!(map_status(StatusCode::NOT_FOUND, "c").is_retryable());
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "c").is_retryable());
        assert!(map_status(StatusCode::GATEWAY_TIMEOUT, "c").is_retryable());
        assert!(!map_status(StatusCode::UNAUTHORIZED, "c").is_retryable());
        assert!(!map_status(StatusCode::CONFLICT, "c").is_retryable());
        assert!(!map_status(StatusCode::UNPROCESSABLE_ENTITY, "c").is_retryable());
    }

    #[test]
    fn request_body_uses_camel_case_keys() {
        let body = TransactionRequest {
            xid: "svc:1:1".into(),
            branch_id: 1001,
            operation: "confirm".into(),
            timestamp: 1_700_000_000_000,
            service_group: "default".into(),
            parameters: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["xid"], "svc:1:1");
        assert_eq!(json["branchId"], 1001);
        assert_eq!(json["operation"], "confirm");
        assert_eq!(json["serviceGroup"], "default");
        assert!(json.get("parameters").is_none());
    }

    #[test]
    fn url_joining() {
        assert_eq!(
            join_url("http://svc:8080", "/transaction/confirm"),
            "http://svc:8080/transaction/confirm"
        );
        assert_eq!(
            join_url("http://svc:8080/", "transaction/cancel"),
            "http://svc:8080/transaction/cancel"
        );
    }

    #[test]
    fn basic_auth_header_is_base64_encoded() {
        use lodestar_core::model::{BranchStatus, BranchTransaction, BranchType};
        use std::sync::Arc;

        let resolver = Arc::new(crate::resolver::StaticResolver::new());
        let config = ExternalServiceConfig {
            auth: AuthConfig::Basic {
                username: "user".into(),
                password: "pass".into(),
            },
            ..Default::default()
        };
        let client = ExternalServiceClient::new(resolver, config);

        let branch = BranchTransaction {
            branch_id: 1001,
            xid: "svc:1:1".into(),
            resource_group_id: "default".into(),
            resource_id: "pay-service".into(),
            branch_type: BranchType::Http,
            lock_key: None,
            status: BranchStatus::PhaseOneDone,
            application_data: None,
            begin_time_ms: 0,
            end_time_ms: None,
            timeout_ms: 30_000,
        };
        let headers = client.build_headers(&branch);
        assert_eq!(
            headers.get("Authorization").and_then(|v| v.to_str().ok()),
            Some(format!("Basic {}", STANDARD.encode(b"user:pass")).as_str())
        );
        // "user:pass" in base64
        assert_eq!(STANDARD.encode(b"user:pass"), "dXNlcjpwYXNz");
    }
}
