use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};

use merlin_core::errors::GatewayError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_client() -> Result<Client, GatewayError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))
}

/// Send a streaming request and map transport and status failures.
pub async fn send(request: RequestBuilder, timeout: Duration) -> Result<Response, GatewayError> {
    let response = request.timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            GatewayError::Timeout(timeout)
        } else {
            GatewayError::NetworkError(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let retry_after = retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        return Err(match GatewayError::from_status(status, body) {
            GatewayError::RateLimited { .. } => GatewayError::RateLimited { retry_after },
            other => other,
        });
    }
    Ok(response)
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
