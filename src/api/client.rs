use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use url::Url;

use super::error::ApiError;
use super::types::{
    CommentReceipt, LikeReceipt, MediaBlob, NewComment, NewPost, PageBody, PostBody,
};
use super::{FeedApi, MediaSource};
use crate::model::FeedItem;
use crate::network::Prober;
use crate::util::{validate_api_url, validate_media_url};

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_ERROR_BODY: usize = 4 * 1024;

/// Tunables for [`ApiClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    /// Retries for idempotent reads on 429/5xx. Mutations are never retried
    /// here; the offline queue owns that.
    pub max_retries: u32,
    /// First backoff step; doubles per retry
    pub retry_base: Duration,
    pub max_media_bytes: usize,
    /// Permit loopback/private hosts (local backends and tests)
    pub allow_private_hosts: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base: Duration::from_secs(2),
            max_media_bytes: 8 * 1024 * 1024,
            allow_private_hosts: false,
        }
    }
}

/// HTTP client for the backend API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<SecretString>,
    options: ClientOptions,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("options", &self.options)
            .finish()
    }
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        options: ClientOptions,
    ) -> Result<Self, ApiError> {
        let mut base = validate_api_url(base_url, options.allow_private_hosts)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        // Url::join drops the last segment unless the base ends with '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            token,
            options,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    /// Endpoint of the realtime push stream.
    pub fn stream_url(&self) -> Result<Url, ApiError> {
        self.endpoint("feed/stream")
    }

    pub(crate) fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    /// Send a request, retrying 429 and 5xx with exponential backoff up to
    /// `retries` times. Non-2xx answers become [`ApiError::HttpStatus`].
    async fn send<F>(&self, build: F, retries: u32) -> Result<reqwest::Response, ApiError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retry_count = 0;

        loop {
            let response = tokio::time::timeout(self.options.request_timeout, build().send())
                .await
                .map_err(|_| ApiError::Timeout)?
                .map_err(ApiError::Network)?;

            let status = response.status();

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= retries {
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS && retries > 0 {
                        return Err(ApiError::RateLimited(retries));
                    }
                    return Err(ApiError::HttpStatus {
                        status: status.as_u16(),
                        message: error_message(response).await,
                    });
                }

                let delay = self.options.retry_base * 2u32.pow(retry_count);
                tracing::warn!(
                    url = %response.url(),
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server busy or failing, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                return Err(ApiError::HttpStatus {
                    status: status.as_u16(),
                    message: error_message(response).await,
                });
            }

            return Ok(response);
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let bytes = read_limited_bytes(response, MAX_RESPONSE_SIZE).await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

impl FeedApi for ApiClient {
    async fn fetch_page(&self, page: u32, limit: u32) -> Result<Vec<FeedItem>, ApiError> {
        let mut url = self.endpoint("feed")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("limit", &limit.to_string());

        let response = self
            .send(|| self.authorize(self.http.get(url.clone())), self.options.max_retries)
            .await?;
        let body: PageBody = self.read_json(response).await?;
        let items = body.into_items();
        tracing::debug!(page = page, limit = limit, received = items.len(), "Fetched feed page");
        Ok(items)
    }

    async fn set_like(&self, post_id: &str, liked: bool) -> Result<LikeReceipt, ApiError> {
        let url = self.endpoint(&format!("posts/{post_id}/like"))?;
        let body = serde_json::json!({ "liked": liked });
        let response = self
            .send(|| self.authorize(self.http.post(url.clone()).json(&body)), 0)
            .await?;
        self.read_json(response).await
    }

    async fn create_comment(
        &self,
        post_id: &str,
        comment: &NewComment,
    ) -> Result<CommentReceipt, ApiError> {
        let url = self.endpoint(&format!("posts/{post_id}/comments"))?;
        let response = self
            .send(|| self.authorize(self.http.post(url.clone()).json(comment)), 0)
            .await?;
        self.read_json(response).await
    }

    async fn create_post(&self, post: &NewPost) -> Result<FeedItem, ApiError> {
        let url = self.endpoint("posts")?;
        let response = self
            .send(|| self.authorize(self.http.post(url.clone()).json(post)), 0)
            .await?;
        let body: PostBody = self.read_json(response).await?;
        Ok(body.into_item())
    }
}

impl MediaSource for ApiClient {
    async fn fetch_media(&self, url: &str) -> Result<MediaBlob, ApiError> {
        let url = validate_media_url(url, self.options.allow_private_hosts)
            .map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        // Media lives on CDNs, not the API host: no bearer token
        let response = self
            .send(|| self.http.get(url.clone()), self.options.max_retries)
            .await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = read_limited_bytes(response, self.options.max_media_bytes).await?;

        Ok(MediaBlob {
            bytes,
            content_type,
        })
    }
}

impl Prober for ApiClient {
    async fn probe(&self) -> Result<(), ApiError> {
        let url = self.endpoint("health")?;
        self.send(|| self.authorize(self.http.get(url.clone())), 0)
            .await
            .map(|_| ())
    }
}

async fn error_message(response: reqwest::Response) -> Option<String> {
    let bytes = read_limited_bytes(response, MAX_ERROR_BODY).await.ok()?;
    let text = String::from_utf8_lossy(&bytes).trim().to_string();
    (!text.is_empty()).then_some(text)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, ApiError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(ApiError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ApiError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ApiError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
