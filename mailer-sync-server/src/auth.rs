//! The admin gate every orchestrator route passes through: either the
//! configured service token (internal self-invocation) or a user
//! credential the CRM resolves to the admin role.

use crate::settings::AuthSettings;
use actix_web::{http::header, HttpRequest};
use serde::Deserialize;
use thiserror::Error;

const ADMIN_ROLE: &str = "admin";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("auth backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialInfo {
    id: String,
    role: String,
}

#[derive(Clone)]
pub struct AdminGate {
    settings: AuthSettings,
    http: reqwest::Client,
}

impl AdminGate {
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    /// Returns the resolved principal id, or the 401/403-mapped error.
    pub async fn require_admin(&self, req: &HttpRequest) -> Result<String, AuthError> {
        let token = extract_bearer(req)?;

        if let Some(service_token) = &self.settings.service_token {
            if token == *service_token {
                return Ok("service".to_string());
            }
        }

        let Some(url) = &self.settings.credentials_url else {
            return Err(AuthError::Unauthorized("unknown credential".to_string()));
        };
        let response = self
            .http
            .get(url.clone())
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|err| AuthError::Backend(err.to_string()))?;

        match response.status().as_u16() {
            200 => {
                let info: CredentialInfo = response
                    .json()
                    .await
                    .map_err(|err| AuthError::Backend(err.to_string()))?;
                if info.role == ADMIN_ROLE {
                    Ok(info.id)
                } else {
                    Err(AuthError::Forbidden(format!(
                        "role {:?} may not invoke sync operations",
                        info.role
                    )))
                }
            }
            401 | 403 => Err(AuthError::Unauthorized("credential rejected".to_string())),
            status => Err(AuthError::Backend(format!(
                "credential endpoint returned {status}"
            ))),
        }
    }
}

fn extract_bearer(req: &HttpRequest) -> Result<String, AuthError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AuthError::Unauthorized("missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| AuthError::Unauthorized("malformed authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_owned)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::Unauthorized("expected bearer token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn request_with_token(token: &str) -> HttpRequest {
        TestRequest::default()
            .insert_header(("authorization", format!("Bearer {token}")))
            .to_http_request()
    }

    #[actix_web::test]
    async fn missing_header_is_unauthorized() {
        let gate = AdminGate::new(AuthSettings::default());
        let req = TestRequest::default().to_http_request();
        let err = gate.require_admin(&req).await.expect_err("rejected");
        assert!(matches!(err, AuthError::Unauthorized(_)), "{err:?}");
    }

    #[actix_web::test]
    async fn service_token_is_accepted_without_a_backend() {
        let gate = AdminGate::new(AuthSettings {
            service_token: Some("internal".to_string()),
            credentials_url: None,
        });
        let principal = gate
            .require_admin(&request_with_token("internal"))
            .await
            .expect("accepted");
        assert_eq!(principal, "service");
    }

    #[actix_web::test]
    async fn unknown_token_without_backend_is_unauthorized() {
        let gate = AdminGate::new(AuthSettings {
            service_token: Some("internal".to_string()),
            credentials_url: None,
        });
        let err = gate
            .require_admin(&request_with_token("somebody-else"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, AuthError::Unauthorized(_)), "{err:?}");
    }

    #[actix_web::test]
    async fn admin_credential_resolves_to_its_account() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .and(header("authorization", "Bearer user-jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "user-42",
                "role": "admin"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gate = AdminGate::new(AuthSettings {
            service_token: None,
            credentials_url: Some(
                url::Url::parse(&format!("{}/api/auth/me", server.uri())).unwrap(),
            ),
        });
        let principal = gate
            .require_admin(&request_with_token("user-jwt"))
            .await
            .expect("accepted");
        assert_eq!(principal, "user-42");
    }

    #[actix_web::test]
    async fn non_admin_role_is_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "user-7",
                "role": "advisor"
            })))
            .mount(&server)
            .await;

        let gate = AdminGate::new(AuthSettings {
            service_token: None,
            credentials_url: Some(url::Url::parse(&server.uri()).unwrap()),
        });
        let err = gate
            .require_admin(&request_with_token("user-jwt"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, AuthError::Forbidden(_)), "{err:?}");
    }

    #[actix_web::test]
    async fn rejected_credential_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "expired"})))
            .mount(&server)
            .await;

        let gate = AdminGate::new(AuthSettings {
            service_token: None,
            credentials_url: Some(url::Url::parse(&server.uri()).unwrap()),
        });
        let err = gate
            .require_admin(&request_with_token("stale-jwt"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, AuthError::Unauthorized(_)), "{err:?}");
    }
}
