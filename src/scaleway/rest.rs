//! REST plumbing for the Instances API endpoints the SDK does not cover.

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ScalewayProvider, ScalewayProviderError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
pub(super) const PAGE_SIZE: &str = "100";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

impl ScalewayProvider {
    fn url(&self, path: &str) -> String {
        format!(
            "{SCALEWAY_INSTANCE_API_BASE}/zones/{}/{path}",
            self.zone.as_str()
        )
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        HTTP_CLIENT
            .request(method, self.url(path))
            .header("X-Auth-Token", &self.config.secret_key)
    }

    /// Reads one object, returning `None` on 404.
    pub(super) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, ScalewayProviderError> {
        let response = self.request(Method::GET, path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    /// Reads a collection with query parameters.
    pub(super) async fn list_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ScalewayProviderError> {
        let response = self.request(Method::GET, path).query(query).send().await?;
        Self::decode(response).await
    }

    /// Sends a JSON body and decodes the JSON answer.
    pub(super) async fn send_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T, ScalewayProviderError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request(method, path).json(body).send().await?;
        Self::decode(response).await
    }

    /// Sends a JSON body, ignoring the answer's content.
    pub(super) async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ScalewayProviderError> {
        let response = self.request(Method::PATCH, path).json(body).send().await?;
        Self::expect_success(response).await
    }

    pub(super) async fn delete_path(&self, path: &str) -> Result<(), ScalewayProviderError> {
        let response = self.request(Method::DELETE, path).send().await?;
        Self::expect_success(response).await
    }

    async fn expect_success(response: Response) -> Result<(), ScalewayProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.bytes().await?;
        Err(api_error(status, &body))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ScalewayProviderError> {
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        serde_json::from_slice(&body).map_err(|err| ScalewayProviderError::Provider {
            message: format!("unexpected response body: {err}"),
        })
    }
}

/// Builds an error from a failed response, preferring the API's message.
pub(super) fn api_error(status: StatusCode, body: &[u8]) -> ScalewayProviderError {
    let message = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(body).map_or_else(
        |_| String::from_utf8_lossy(body).into_owned(),
        |api_err| api_err.message,
    );
    ScalewayProviderError::Api {
        status: status.as_u16(),
        message,
    }
}
