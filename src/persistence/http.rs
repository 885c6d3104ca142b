use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ApiError, LayoutApi, LayoutDocument, UpdateLayoutRequest};
use crate::resolver::UiAssociations;

/// [`LayoutApi`] over the patch service's HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpLayoutApi {
    client: Client,
    base_url: String,
    bearer: Option<String>,
}

impl HttpLayoutApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer: None,
        }
    }

    /// Token sent with layout updates, which the service authenticates.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn url(&self, route: &str, patch_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, route, patch_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `Ok(None)` on 404; other non-success statuses are errors.
    async fn get_optional<T: DeserializeOwned>(&self, url: String) -> Result<Option<T>, ApiError> {
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => decode(response).await.map(Some),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode(err.to_string()))
}

impl LayoutApi for HttpLayoutApi {
    async fn fetch_layout(&self, patch_id: &str) -> Result<Option<LayoutDocument>, ApiError> {
        self.get_optional(self.url("getLayout", patch_id)).await
    }

    async fn update_layout(
        &self,
        patch_id: &str,
        request: &UpdateLayoutRequest,
    ) -> Result<(), ApiError> {
        let url = self.url("updateLayout", patch_id);
        let response = self
            .authorize(self.client.put(&url).json(request))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound(patch_id.to_string())),
            status => Err(ApiError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }

    async fn fetch_ui_associations(
        &self,
        patch_id: &str,
    ) -> Result<Option<UiAssociations>, ApiError> {
        self.get_optional(self.url("getUIAssociations", patch_id))
            .await
    }

    async fn fetch_patch(&self, patch_id: &str) -> Result<Option<Value>, ApiError> {
        self.get_optional(self.url("getPatch", patch_id)).await
    }
}
