//! Shared plumbing for HTTP-backed engines.

use dh_engine::EngineError;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Builds a client whose every request carries `timeout`.
pub(crate) fn client(timeout: Duration) -> Result<Client, EngineError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))
}

pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(timeout)
    } else {
        EngineError::Transport(err.to_string())
    }
}

/// Passes a 2xx response through; anything else becomes a typed error
/// carrying the response body.
pub(crate) async fn ensure_success(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(EngineError::from_status(status.as_u16(), body))
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, EngineError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| EngineError::Transport(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::MalformedResponse(e.to_string()))
}

/// MiniMax reports application errors in a `base_resp` block on HTTP 200.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct MiniMaxBaseResp {
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub status_msg: String,
}

impl MiniMaxBaseResp {
    pub(crate) fn into_result(self) -> Result<(), EngineError> {
        let message = format!("MiniMax {}: {}", self.status_code, self.status_msg);
        match self.status_code {
            0 => Ok(()),
            1002 => Err(EngineError::Provider {
                status: 429,
                message,
            }),
            1004 | 1008 => Err(EngineError::Auth(message)),
            1000 | 1001 | 1013 => Err(EngineError::Provider {
                status: 503,
                message,
            }),
            _ => Err(EngineError::Provider {
                status: 400,
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimax_codes_map_to_retry_classes() {
        let ok = MiniMaxBaseResp::default();
        assert!(ok.into_result().is_ok());

        let limited = MiniMaxBaseResp {
            status_code: 1002,
            status_msg: "rate limit".into(),
        };
        assert!(limited.into_result().unwrap_err().is_retryable());

        let auth = MiniMaxBaseResp {
            status_code: 1004,
            status_msg: "auth failed".into(),
        };
        assert!(matches!(auth.into_result(), Err(EngineError::Auth(_))));

        let params = MiniMaxBaseResp {
            status_code: 2013,
            status_msg: "invalid params".into(),
        };
        assert!(!params.into_result().unwrap_err().is_retryable());
    }
}
