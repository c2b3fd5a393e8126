//! HTTP client implementation

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::FleetError;

/// JSON client for the control plane API
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    device_id: Option<String>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FleetError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| FleetError::ConfigError(format!("invalid base url {}: {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FleetError::ConfigError(format!(
                "unsupported base url scheme: {}",
                parsed.scheme()
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id: None,
        })
    }

    /// Identify every request with the `X-Device-ID` header
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET that maps `204 No Content` and `404 Not Found` to `None`
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, FleetError> {
        let response = self.request(Method::GET, path).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            _ => {
                let response = check(Method::GET, path, response).await?;
                Ok(Some(response.json().await?))
            }
        }
    }

    /// POST a JSON body, ignoring the response body
    pub async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<(), FleetError> {
        let request = self.request(Method::POST, path).json(body);
        self.send(Method::POST, path, request).await?;
        Ok(())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url);
        if let Some(device_id) = &self.device_id {
            request = request.header("X-Device-ID", device_id);
        }
        request
    }

    async fn send(&self, method: Method, path: &str, request: RequestBuilder) -> Result<Response, FleetError> {
        let response = request.send().await?;
        check(method, path, response).await
    }
}

async fn check(method: Method, path: &str, response: Response) -> Result<Response, FleetError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("HTTP {} {} failed: {} - {}", method, path, status, body);
    Err(status_error(status, &format!("{} {}: {}", method, path, body)))
}

/// Map a failed response to the error taxonomy
pub(crate) fn status_error(status: StatusCode, context: &str) -> FleetError {
    match status {
        s if s.is_server_error()
            || s == StatusCode::TOO_MANY_REQUESTS
            || s == StatusCode::REQUEST_TIMEOUT =>
        {
            FleetError::Transient(format!("{} ({})", context, status))
        }
        StatusCode::NOT_FOUND => FleetError::NotFound(context.to_string()),
        StatusCode::CONFLICT => FleetError::InvalidState(context.to_string()),
        _ => FleetError::InvalidInput(format!("{} ({})", context, status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            HttpClient::new("not a url", Duration::from_secs(1)),
            Err(FleetError::ConfigError(_))
        ));
        assert!(HttpClient::new("ftp://control", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_trims_trailing_slash() {
        let client = HttpClient::new("http://control:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://control:8080");
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "x").is_retryable());
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "x"),
            FleetError::NotFound(_)
        ));
        assert!(matches!(
            status_error(StatusCode::CONFLICT, "x"),
            FleetError::InvalidState(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "x"),
            FleetError::InvalidInput(_)
        ));
    }
}
