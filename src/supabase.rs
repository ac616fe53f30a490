//! PostgREST client for the hosted backend
//!
//! Only the calls the maintenance commands need: `rpc`, `select`, `insert`.
//! Every call returns a [`RemoteFailure`] on rejection instead of an error,
//! so callers decide whether a rejection is fatal.

use crate::config::SupabaseConfig;
use crate::error::{AppError, RemoteFailure};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub struct SupabaseClient {
    http: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(config: &SupabaseConfig, timeout: Duration) -> Result<Self, AppError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: config.url.as_str().trim_end_matches('/').to_string(),
            service_role_key: config.service_role_key.clone(),
        })
    }

    /// `{base}/rest/v1/{path}`
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }

    /// Call a database function through `POST /rest/v1/rpc/{function}`
    pub async fn rpc<B: Serialize + ?Sized>(&self, function: &str, body: &B) -> Result<(), RemoteFailure> {
        let url = self.endpoint(&format!("rpc/{}", function));
        debug!("POST {}", url);

        let response = self
            .authorized(self.http.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteFailure::transport(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    /// `GET /rest/v1/{table}?{query}`
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, RemoteFailure> {
        let url = self.endpoint(table);
        debug!("GET {} {:?}", url, query);

        let response = self
            .authorized(self.http.get(&url))
            .query(query)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| RemoteFailure::transport(e.to_string()))?;

        let body = Self::check(response).await?;
        serde_json::from_str(&body).map_err(|e| RemoteFailure::transport(format!("Invalid response body: {}", e)))
    }

    /// `POST /rest/v1/{table}` with one row
    pub async fn insert<T: Serialize>(&self, table: &str, row: &T) -> Result<(), RemoteFailure> {
        let url = self.endpoint(table);
        debug!("POST {}", url);

        let response = self
            .authorized(self.http.post(&url))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|e| RemoteFailure::transport(e.to_string()))?;

        Self::check(response).await.map(|_| ())
    }

    async fn check(response: reqwest::Response) -> Result<String, RemoteFailure> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteFailure::transport(e.to_string()))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(parse_error(status, &body))
        }
    }
}

/// Turn a non-2xx PostgREST response into a [`RemoteFailure`]
pub fn parse_error(status: StatusCode, body: &str) -> RemoteFailure {
    match serde_json::from_str::<RemoteFailure>(body) {
        Ok(mut failure) => {
            if failure.code.is_none() {
                failure.code = Some(status.as_u16().to_string());
            }
            failure
        }
        Err(_) => {
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body.chars().take(500).collect()
            };
            RemoteFailure::new(Some(status.as_u16().to_string()), message)
        }
    }
}
