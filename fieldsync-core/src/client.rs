use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    InvalidBaseUrl(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the `/api/{collection}` REST surface.
///
/// Any 2xx counts as success; everything else comes back as [`ApiError::Api`].
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub async fn list(&self, collection: &str) -> Result<Vec<Value>, ApiError> {
        let url = self.endpoint(collection, None)?;
        let response = self.authorize(self.http.get(url)).send().await?;
        let body = Self::success_body(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(collection, Some(id))?;
        let response = self.authorize(self.http.get(url)).send().await?;
        let body = Self::success_body(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Returns the created record when the server answered with a JSON body.
    pub async fn create(&self, collection: &str, body: &Value) -> Result<Option<Value>, ApiError> {
        let url = self.endpoint(collection, None)?;
        let response = self.authorize(self.http.post(url).json(body)).send().await?;
        let body = Self::success_body(response).await?;
        Ok(parse_optional_json(&body))
    }

    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        body: &Value,
    ) -> Result<Option<Value>, ApiError> {
        let url = self.endpoint(collection, Some(id))?;
        let response = self.authorize(self.http.put(url).json(body)).send().await?;
        let body = Self::success_body(response).await?;
        Ok(parse_optional_json(&body))
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), ApiError> {
        let url = self.endpoint(collection, Some(id))?;
        let response = self.authorize(self.http.delete(url)).send().await?;
        Self::success_body(response).await?;
        Ok(())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn endpoint(&self, collection: &str, id: Option<&str>) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidBaseUrl(self.base_url.to_string()))?;
            segments.pop_if_empty().push("api").push(collection);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn success_body(response: reqwest::Response) -> Result<String, ApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response.text().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }
}

impl ApiError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            ApiError::Api { status, .. } => classify_api_status(*status),
            ApiError::Request(_) => ApiErrorClass::Transient,
            ApiError::Url(_) | ApiError::InvalidBaseUrl(_) | ApiError::Decode(_) => {
                ApiErrorClass::Permanent
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_optional_json(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    serde_json::from_str(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_collection_and_encoded_id() {
        let client = ApiClient::new("https://example.test/base/").unwrap();
        let url = client.endpoint("signals", Some("a b/c")).unwrap();
        assert_eq!(url.as_str(), "https://example.test/base/api/signals/a%20b%2Fc");
    }

    #[test]
    fn endpoint_without_trailing_slash() {
        let client = ApiClient::new("https://example.test").unwrap();
        let url = client.endpoint("ideas", None).unwrap();
        assert_eq!(url.as_str(), "https://example.test/api/ideas");
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::BAD_REQUEST),
            ApiErrorClass::Permanent
        );
        assert_eq!(
            classify_api_status(StatusCode::SERVICE_UNAVAILABLE),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::FORBIDDEN),
            ApiErrorClass::Auth
        );
    }

    #[test]
    fn empty_or_invalid_bodies_parse_to_none() {
        assert_eq!(parse_optional_json(""), None);
        assert_eq!(parse_optional_json("  "), None);
        assert_eq!(parse_optional_json("ok"), None);
        assert_eq!(
            parse_optional_json("{\"id\":\"1\"}"),
            Some(serde_json::json!({"id": "1"}))
        );
    }
}
