use super::types::{
    BatchEnvelope, BatchRequest, BatchSubRequest, ListEnvelope, SubscriberEnvelope,
    SubscriberPatchBody, SubscriberUpsertBody,
};
use crate::{
    error::ClientError,
    merge::FieldUpdate,
    rate_limiter::{RateLimiter, RateLimiterMiddleware},
    settings::MailerliteSettings,
    types::{canonical_email, FieldView, ManagedField, Subscriber},
};
use anyhow::Context;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER},
    Method, StatusCode,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::time::sleep;
use url::Url;

/// The batch endpoint takes at most this many embedded sub-requests.
pub const BATCH_LIMIT: usize = 100;

// One initial try plus three retries for 429/5xx.
const MAX_ATTEMPTS: u32 = 4;
const SERVER_BACKOFF: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum BatchLookup {
    Found(Subscriber),
    NotFound,
    Failed { status: u16 },
}

#[derive(Debug, Clone)]
pub struct SubscriberPage {
    pub subscribers: Vec<Subscriber>,
    pub next_cursor: Option<String>,
}

/// Authenticated mailerlite client. Every attempt that leaves the process
/// passes through the rate limiter middleware.
#[derive(Clone)]
pub struct Client {
    http: ClientWithMiddleware,
    base_url: Url,
}

impl Client {
    pub fn new(
        settings: &MailerliteSettings,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, anyhow::Error> {
        let mut base_url = settings.api_url.clone();
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", settings.api_token))
            .context("api token is not a valid header value")?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let reqwest_client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .default_headers(headers)
            .build()
            .context("failed to build http client")?;
        let http = ClientBuilder::new(reqwest_client)
            .with(RateLimiterMiddleware::new(limiter))
            .build();

        Ok(Self { http, base_url })
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Subscriber>, ClientError> {
        let path = format!("api/subscribers/{id}");
        match self
            .request::<SubscriberEnvelope>(Method::GET, &path, None)
            .await
        {
            Ok(envelope) => Ok(Some(envelope.data.into())),
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The subscriber endpoint accepts an email as the identifier, which
    /// doubles as the search-by-email operation.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<Subscriber>, ClientError> {
        let path = format!("api/subscribers/{}", canonical_email(email));
        match self
            .request::<SubscriberEnvelope>(Method::GET, &path, None)
            .await
        {
            Ok(envelope) => Ok(Some(envelope.data.into())),
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list_page(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<SubscriberPage, ClientError> {
        let mut path = format!("api/subscribers?limit={limit}");
        if let Some(cursor) = cursor {
            path.push_str(&format!("&cursor={cursor}"));
        }
        let envelope = self
            .request::<ListEnvelope>(Method::GET, &path, None)
            .await?;
        Ok(SubscriberPage {
            subscribers: envelope.data.into_iter().map(Into::into).collect(),
            next_cursor: envelope.meta.and_then(|meta| meta.next_cursor),
        })
    }

    /// One logical batch call costs one rate-limit token regardless of the
    /// number of embedded lookups.
    pub async fn get_batch(
        &self,
        emails: &[String],
    ) -> Result<BTreeMap<String, BatchLookup>, ClientError> {
        if emails.len() > BATCH_LIMIT {
            return Err(ClientError::Validation {
                body: format!(
                    "batch of {} exceeds the {BATCH_LIMIT} sub-request limit",
                    emails.len()
                ),
            });
        }

        let body = BatchRequest {
            requests: emails
                .iter()
                .map(|email| BatchSubRequest {
                    method: "GET".to_string(),
                    path: format!("api/subscribers/{}", canonical_email(email)),
                })
                .collect(),
        };
        let envelope = self
            .request::<BatchEnvelope>(
                Method::POST,
                "api/batch",
                Some(serde_json::to_value(&body)?),
            )
            .await?;

        if envelope.responses.len() != emails.len() {
            return Err(ClientError::Validation {
                body: format!(
                    "batch returned {} responses for {} requests",
                    envelope.responses.len(),
                    emails.len()
                ),
            });
        }

        let mut results = BTreeMap::new();
        for (email, response) in emails.iter().zip(envelope.responses) {
            let lookup = match response.code {
                200 | 201 => {
                    let parsed: SubscriberEnvelope = serde_json::from_value(response.body)?;
                    BatchLookup::Found(parsed.data.into())
                }
                404 => BatchLookup::NotFound,
                status => BatchLookup::Failed { status },
            };
            results.insert(canonical_email(email), lookup);
        }
        Ok(results)
    }

    pub async fn create(
        &self,
        email: &str,
        fields: &FieldView,
    ) -> Result<Subscriber, ClientError> {
        let body = SubscriberUpsertBody {
            email: canonical_email(email),
            status: None,
            fields: present_fields(fields),
        };
        let envelope = self
            .request::<SubscriberEnvelope>(
                Method::POST,
                "api/subscribers",
                Some(serde_json::to_value(&body)?),
            )
            .await?;
        Ok(envelope.data.into())
    }

    /// Column-scoped patch: only the given fields are sent, `null` clears
    /// a field remotely.
    pub async fn update(
        &self,
        id: &str,
        updates: &[FieldUpdate],
    ) -> Result<Subscriber, ClientError> {
        let body = SubscriberPatchBody {
            fields: updates
                .iter()
                .map(|update| {
                    (
                        update.field.mailerlite_field().to_string(),
                        update.value.clone(),
                    )
                })
                .collect(),
        };
        let path = format!("api/subscribers/{id}");
        let envelope = self
            .request::<SubscriberEnvelope>(Method::PUT, &path, Some(serde_json::to_value(&body)?))
            .await?;
        Ok(envelope.data.into())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ClientError> {
        let url = self.base_url.join(path_and_query)?;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self.http.request(method.clone(), url.clone());
            if let Some(body) = &body {
                request = request.json(body);
            }
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => return Err(classify_send_error(err)),
            };

            let status = response.status();
            if status.is_success() {
                let text = response
                    .text()
                    .await
                    .map_err(|err| ClientError::Network(err.into()))?;
                return Ok(serde_json::from_str(&text)?);
            }

            match status {
                StatusCode::NOT_FOUND => return Err(ClientError::NotFound),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    return Err(ClientError::Auth {
                        status: status.as_u16(),
                    })
                }
                StatusCode::UNPROCESSABLE_ENTITY => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ClientError::Validation { body });
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(ClientError::RateLimited { attempts: attempt });
                    }
                    let wait = retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER);
                    tracing::warn!(
                        url = %url,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "mailerlite rate limited, backing off"
                    );
                    sleep(wait).await;
                }
                status if status.is_server_error() => {
                    if attempt >= MAX_ATTEMPTS {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ClientError::Server {
                            status: status.as_u16(),
                            attempts: attempt,
                            body,
                        });
                    }
                    let delay = SERVER_BACKOFF[(attempt - 1).min(2) as usize];
                    tracing::warn!(
                        url = %url,
                        attempt,
                        status = status.as_u16(),
                        ?delay,
                        "mailerlite server error, retrying"
                    );
                    sleep(delay).await;
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ClientError::UnexpectedStatus {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
    }
}

fn present_fields(view: &FieldView) -> BTreeMap<String, Option<String>> {
    ManagedField::ALL
        .into_iter()
        .filter_map(|field| {
            view.raw(field)
                .map(|value| (field.mailerlite_field().to_string(), Some(value)))
        })
        .collect()
}

fn classify_send_error(err: reqwest_middleware::Error) -> ClientError {
    let timed_out = matches!(&err, reqwest_middleware::Error::Reqwest(e) if e.is_timeout());
    if timed_out {
        ClientError::Timeout(err)
    } else {
        ClientError::Network(err)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
