use std::time::Duration;

use reqwest::{Client, Response};

use mneme_core::ProviderError;

pub(crate) fn build_client(connect_timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Classify a transport failure. `budget` is reported for timeouts.
pub(crate) fn map_reqwest_error(e: &reqwest::Error, budget: Duration) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(budget)
    } else if e.is_decode() {
        ProviderError::Decode(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Turn a non-2xx response into `ProviderError::Status`.
pub(crate) async fn check_status(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}
