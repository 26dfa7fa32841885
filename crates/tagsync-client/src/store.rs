//! Remote persistence for autosaved state.

use crate::error::{Result, StoreError, SyncError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tagsync_core::{RollbackOutcome, VersionSnapshot};

/// Server-side storage a pipeline writes to.
///
/// Implementations must be `Send + Sync`; pipelines call them from
/// spawned tasks.
pub trait RemoteStore<S>: Send + Sync + 'static {
    /// Background save.
    fn autosave(&self, resource_id: &str, state: &S)
    -> impl Future<Output = std::result::Result<(), StoreError>> + Send;

    /// Explicit user save.
    fn save(&self, resource_id: &str, state: &S)
    -> impl Future<Output = std::result::Result<(), StoreError>> + Send;

    /// Ask the server to snapshot `state`. `message` is `None` for
    /// automatic versions. Returns the new version number.
    fn create_version(
        &self,
        resource_id: &str,
        message: Option<&str>,
        state: &S,
    ) -> impl Future<Output = std::result::Result<u64, StoreError>> + Send;

    fn version_history(
        &self,
        resource_id: &str,
    ) -> impl Future<Output = std::result::Result<Vec<VersionSnapshot>, StoreError>> + Send;

    fn rollback(
        &self,
        resource_id: &str,
        version: u64,
    ) -> impl Future<Output = std::result::Result<RollbackOutcome, StoreError>> + Send;

    fn delete_version(
        &self,
        resource_id: &str,
        version: u64,
    ) -> impl Future<Output = std::result::Result<(), StoreError>> + Send;
}

/// REST implementation of [`RemoteStore`].
///
/// Routes, relative to the base URL:
/// - `POST   projects/{id}/autosave`
/// - `GET    projects/{id}`
/// - `PUT    projects/{id}`
/// - `POST   projects/{id}/versions`
/// - `GET    projects/{id}/versions`
/// - `POST   projects/{id}/versions/{n}/rollback`
/// - `DELETE projects/{id}/versions/{n}`
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: reqwest::Url,
    token: Option<String>,
}

#[derive(Serialize)]
struct StateBody<'a, S> {
    state: &'a S,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVersionBody<'a, S> {
    message: Option<&'a str>,
    is_auto: bool,
    state: &'a S,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedVersion {
    version_number: u64,
}

#[derive(Deserialize)]
struct StateEnvelope<S> {
    state: S,
}

#[derive(Deserialize)]
struct VersionList {
    versions: Vec<VersionSnapshot>,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let base = reqwest::Url::parse(base_url)
            .map_err(|e| SyncError::Config(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Config(format!("{base_url}: not a base URL")));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base,
            token,
        })
    }

    fn url(&self, segments: &[&str]) -> reqwest::Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, segments: &[&str]) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Fetch the stored state of a resource, `None` if the server has none.
    pub async fn fetch<S: DeserializeOwned>(
        &self,
        resource_id: &str,
    ) -> std::result::Result<Option<S>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &["projects", resource_id])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: StateEnvelope<S> = check(response).await?.json().await?;
        Ok(Some(body.state))
    }
}

async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        message,
    })
}

impl<S> RemoteStore<S> for HttpStore
where
    S: Serialize + Sync,
{
    async fn autosave(&self, resource_id: &str, state: &S) -> std::result::Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::POST, &["projects", resource_id, "autosave"])
            .json(&StateBody { state })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn save(&self, resource_id: &str, state: &S) -> std::result::Result<(), StoreError> {
        let response = self
            .request(reqwest::Method::PUT, &["projects", resource_id])
            .json(&StateBody { state })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn create_version(
        &self,
        resource_id: &str,
        message: Option<&str>,
        state: &S,
    ) -> std::result::Result<u64, StoreError> {
        let body = CreateVersionBody {
            message,
            is_auto: message.is_none(),
            state,
        };
        let response = self
            .request(reqwest::Method::POST, &["projects", resource_id, "versions"])
            .json(&body)
            .send()
            .await?;
        let created: CreatedVersion = check(response).await?.json().await?;
        Ok(created.version_number)
    }

    async fn version_history(
        &self,
        resource_id: &str,
    ) -> std::result::Result<Vec<VersionSnapshot>, StoreError> {
        let response = self
            .request(reqwest::Method::GET, &["projects", resource_id, "versions"])
            .send()
            .await?;
        let list: VersionList = check(response).await?.json().await?;
        Ok(list.versions)
    }

    async fn rollback(
        &self,
        resource_id: &str,
        version: u64,
    ) -> std::result::Result<RollbackOutcome, StoreError> {
        let version = version.to_string();
        let response = self
            .request(
                reqwest::Method::POST,
                &["projects", resource_id, "versions", &version, "rollback"],
            )
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn delete_version(
        &self,
        resource_id: &str,
        version: u64,
    ) -> std::result::Result<(), StoreError> {
        let version = version.to_string();
        let response = self
            .request(
                reqwest::Method::DELETE,
                &["projects", resource_id, "versions", &version],
            )
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
