use std::fmt::Display;
use std::sync::Arc;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::breaker::{BreakerError, CircuitBreaker};

/// HTTP client whose requests go through a circuit breaker. Transport errors
/// and 5xx responses count against the breaker, 4xx responses do not.
#[derive(Clone)]
pub struct GuardedClient {
    client: Client,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedClient {
    pub fn new(client: Client, breaker: Arc<CircuitBreaker>) -> Self {
        Self { client, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn get(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<Response, BreakerError<reqwest::Error>> {
        let response = self
            .breaker
            .execute(cancel, || async {
                let response = self.client.get(url).send().await?;
                if response.status().is_server_error() {
                    response.error_for_status()
                } else {
                    Ok(response)
                }
            })
            .await?;

        response.error_for_status().map_err(BreakerError::Inner)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<T, BreakerError<reqwest::Error>> {
        self.get(cancel, url)
            .await?
            .json::<T>()
            .await
            .map_err(BreakerError::Inner)
    }
}

/// Degrade to `fallback` when a guarded call fails.
pub fn with_fallback<T, E: Display>(
    name: &str,
    result: Result<T, BreakerError<E>>,
    fallback: impl FnOnce() -> T,
) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(dependency = name, error = %e, "serving fallback");
            fallback()
        }
    }
}
