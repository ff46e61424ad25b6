//! Service Manager REST Client
//!
//! REST implementation of [`ServiceManagerClient`] on top of reqwest.
//!
//! Authentication uses the OAuth2 client-credentials grant against the token URL of
//! the access credentials; tokens are cached until shortly before they expire.

use crate::observability::metrics;
use crate::sm::error::{BrokerError, ServiceManagerError, SmError};
use crate::sm::types::{
    instance_id_from_location, ListQuery, Operation, ProvisionRequest, ProvisionResponse,
    RemoteInstance, UpdateRequest, SERVICE_INSTANCES_PATH,
};
use crate::sm::ServiceManagerClient;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Tokens are refreshed this long before the server-side expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Access credentials of a service manager subaccount binding
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub sm_url: String,
    pub token_url: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("sm_url", &self.sm_url)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

enum TokenSource {
    Static(String),
    ClientCredentials {
        credentials: Credentials,
        cached: Mutex<Option<CachedToken>>,
    },
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    broker_error: Option<BrokerError>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

/// Service manager REST client
pub struct ServiceManagerRest {
    http_client: Client,
    base_url: String,
    auth: TokenSource,
}

impl std::fmt::Debug for ServiceManagerRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManagerRest")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ServiceManagerRest {
    /// Client authenticating with the client-credentials grant
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn new(credentials: Credentials) -> Result<Self, SmError> {
        let base_url = credentials.sm_url.trim_end_matches('/').to_string();
        Ok(Self {
            http_client: Self::http_client()?,
            base_url,
            auth: TokenSource::ClientCredentials {
                credentials,
                cached: Mutex::new(None),
            },
        })
    }

    /// Client using a fixed bearer token
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn with_token(base_url: &str, token: &str) -> Result<Self, SmError> {
        Ok(Self {
            http_client: Self::http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: TokenSource::Static(token.to_string()),
        })
    }

    fn http_client() -> Result<Client, SmError> {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| SmError::Unexpected(format!("failed to create HTTP client: {e}")))
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    async fn token(&self) -> Result<String, SmError> {
        let (credentials, cached) = match &self.auth {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ClientCredentials { credentials, cached } => (credentials, cached),
        };

        let mut cached = cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        debug!("Fetching service manager access token");
        let token_url = format!("{}/oauth/token", credentials.token_url.trim_end_matches('/'));
        let response = self
            .http_client
            .post(token_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let value = token.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });
        Ok(value)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SmError> {
        let token = self.token().await?;
        let response = request.bearer_auth(token).send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: Response) -> SmError {
        let status_code = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
        let description = if parsed.description.is_empty() && parsed.error.is_empty() {
            body
        } else {
            parsed.description
        };
        SmError::Api(ServiceManagerError {
            status_code,
            error: parsed.error,
            description,
            broker_error: parsed.broker_error,
        })
    }

    fn location(response: &Response) -> Option<String> {
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Plan id from the request, or looked up by offering and plan catalog names
    async fn resolve_plan_id(
        &self,
        plan_id: &str,
        offering_name: &str,
        plan_name: &str,
    ) -> Result<String, SmError> {
        if !plan_id.is_empty() || (offering_name.is_empty() && plan_name.is_empty()) {
            return Ok(plan_id.to_string());
        }

        let offerings: Page<IdOnly> = self
            .send(
                self.http_client
                    .get(self.url("/v1/service_offerings"))
                    .query(&[("fieldQuery", format!("catalog_name eq '{offering_name}'"))]),
            )
            .await?
            .json()
            .await?;
        let offering = offerings.items.into_iter().next().ok_or_else(|| {
            SmError::Api(ServiceManagerError::new(
                404,
                format!("couldn't find the service offering '{offering_name}'"),
            ))
        })?;

        let plans: Page<IdOnly> = self
            .send(self.http_client.get(self.url("/v1/service_plans")).query(&[(
                "fieldQuery",
                format!(
                    "catalog_name eq '{plan_name}' and service_offering_id eq '{}'",
                    offering.id
                ),
            )]))
            .await?
            .json()
            .await?;
        plans
            .items
            .into_iter()
            .next()
            .map(|plan| plan.id)
            .ok_or_else(|| {
                SmError::Api(ServiceManagerError::new(
                    404,
                    format!("couldn't find the service plan '{plan_name}' for offering '{offering_name}'"),
                ))
            })
    }

    async fn set_shared(&self, instance_id: &str, shared: bool) -> Result<(), SmError> {
        self.send(
            self.http_client
                .patch(self.url(&format!("{SERVICE_INSTANCES_PATH}/{instance_id}")))
                .json(&serde_json::json!({ "shared": shared })),
        )
        .await?;
        Ok(())
    }
}

/// Run one service manager call with its span and metrics
async fn observed<T, F>(operation: &'static str, call: F) -> Result<T, SmError>
where
    F: Future<Output = Result<T, SmError>>,
{
    let span = info_span!("service_manager.call", operation = operation);
    async move {
        let start = Instant::now();
        let result = call.await;
        metrics::record_sm_operation(operation, start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics::increment_sm_operation_errors(operation, e.classify().as_str());
            warn!("Service manager {} failed: {}", operation, e);
        }
        result
    }
    .instrument(span)
    .await
}

#[async_trait]
impl ServiceManagerClient for ServiceManagerRest {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, SmError> {
        observed("provision", async {
            let plan_id = self
                .resolve_plan_id(
                    &request.service_plan_id,
                    &request.service_offering_name,
                    &request.service_plan_name,
                )
                .await?;
            let body = ProvisionRequest {
                service_plan_id: plan_id,
                ..request.clone()
            };
            let response = self
                .send(
                    self.http_client
                        .post(self.url(SERVICE_INSTANCES_PATH))
                        .query(&[("async", "true")])
                        .json(&body),
                )
                .await?;

            if response.status() == StatusCode::ACCEPTED {
                let location = Self::location(&response).ok_or_else(|| {
                    SmError::Unexpected("asynchronous provision returned no operation location".to_string())
                })?;
                return Ok(ProvisionResponse {
                    instance_id: instance_id_from_location(&location).unwrap_or_default(),
                    subaccount_id: String::new(),
                    location: Some(location),
                });
            }

            let instance: RemoteInstance = response.json().await?;
            Ok(ProvisionResponse {
                subaccount_id: instance.subaccount_id().unwrap_or_default().to_string(),
                instance_id: instance.id,
                location: None,
            })
        })
        .await
    }

    async fn update_instance(
        &self,
        instance_id: &str,
        request: &UpdateRequest,
    ) -> Result<Option<String>, SmError> {
        observed("update", async {
            let plan_id = self
                .resolve_plan_id(
                    &request.service_plan_id,
                    &request.service_offering_name,
                    &request.service_plan_name,
                )
                .await?;
            let body = UpdateRequest {
                service_plan_id: plan_id,
                ..request.clone()
            };
            let response = self
                .send(
                    self.http_client
                        .patch(self.url(&format!("{SERVICE_INSTANCES_PATH}/{instance_id}")))
                        .query(&[("async", "true")])
                        .json(&body),
                )
                .await?;
            Ok((response.status() == StatusCode::ACCEPTED)
                .then(|| Self::location(&response))
                .flatten())
        })
        .await
    }

    async fn deprovision(&self, instance_id: &str) -> Result<Option<String>, SmError> {
        observed("deprovision", async {
            let response = self
                .send(
                    self.http_client
                        .delete(self.url(&format!("{SERVICE_INSTANCES_PATH}/{instance_id}")))
                        .query(&[("async", "true")]),
                )
                .await?;
            Ok((response.status() == StatusCode::ACCEPTED)
                .then(|| Self::location(&response))
                .flatten())
        })
        .await
    }

    async fn get_instance_by_id(&self, instance_id: &str) -> Result<RemoteInstance, SmError> {
        observed("get_instance", async {
            let response = self
                .send(
                    self.http_client
                        .get(self.url(&format!("{SERVICE_INSTANCES_PATH}/{instance_id}"))),
                )
                .await?;
            Ok(response.json().await?)
        })
        .await
    }

    async fn list_instances(&self, query: &ListQuery) -> Result<Vec<RemoteInstance>, SmError> {
        observed("list_instances", async {
            let mut params: Vec<(&str, String)> = Vec::new();
            if !query.label_query.is_empty() {
                params.push(("labelQuery", query.label_query.join(" and ")));
            }
            if !query.field_query.is_empty() {
                params.push(("fieldQuery", query.field_query.join(" and ")));
            }
            if query.attach_last_operations {
                params.push(("attach_last_operations", "true".to_string()));
            }
            let response = self
                .send(
                    self.http_client
                        .get(self.url(SERVICE_INSTANCES_PATH))
                        .query(&params),
                )
                .await?;
            let page: Page<RemoteInstance> = response.json().await?;
            Ok(page.items)
        })
        .await
    }

    async fn status(&self, location: &str) -> Result<Operation, SmError> {
        observed("status", async {
            let response = self.send(self.http_client.get(self.url(location))).await?;
            Ok(response.json().await?)
        })
        .await
    }

    async fn share_instance(&self, instance_id: &str) -> Result<(), SmError> {
        observed("share", self.set_shared(instance_id, true)).await
    }

    async fn unshare_instance(&self, instance_id: &str) -> Result<(), SmError> {
        observed("unshare", self.set_shared(instance_id, false)).await
    }
}
