//! Shared plumbing for the REST-backed provider managers.

use serde::de::DeserializeOwned;

use crate::errors::{Error, Result};

/// Classifies a transport-level send failure.
pub fn request_error(op: &str, e: &reqwest::Error) -> Error {
    Error::API {
        message: format!("failed to send {} {:?}", op, e),
        is_retryable: e.is_timeout() || e.is_connect(),
    }
}

fn status_error(op: &str, status: reqwest::StatusCode, body: String) -> Error {
    Error::API {
        message: format!(
            "unexpected response code {} for {} ({})",
            status.as_u16(),
            op,
            body
        ),
        is_retryable: status.as_u16() == 429 || status.is_server_error(),
    }
}

/// Checks the response status and decodes the JSON body. Rate limiting and
/// server-side errors are retryable, other failures are not.
pub async fn read_json<T: DeserializeOwned>(op: &str, resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(op, status, body));
    }
    resp.json::<T>().await.map_err(|e| Error::API {
        message: format!("failed to decode {} response {:?}", op, e),
        is_retryable: false,
    })
}

/// Same status handling for calls whose response body is discarded.
pub async fn expect_success(op: &str, resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(status_error(op, status, body));
    }
    Ok(())
}
