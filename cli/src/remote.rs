use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use basket_core::models::{PersistedBundle, RemoteBundle, UserProfile, normalize_email};
use basket_core::remote::RemoteStore;

#[derive(Deserialize)]
struct ExistsResponse {
    exists: bool,
}

/// Client for the `basket serve` document-store API.
pub struct HttpRemote {
    client: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let base =
            Url::parse(base_url).with_context(|| format!("Invalid remote URL '{base_url}'"))?;
        if base.cannot_be_a_base() {
            bail!("Invalid remote URL '{base_url}'");
        }
        let client = reqwest::Client::builder()
            .user_agent(format!("basket-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base,
            api_key,
        })
    }

    /// `{base}/api/users[/{email}[/{suffix}]]`, with the email percent-encoded
    /// as a single path segment.
    fn url(&self, email: Option<&str>, suffix: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow::anyhow!("Invalid remote URL '{}'", self.base))?;
            segments.pop_if_empty().extend(["api", "users"]);
            if let Some(email) = email {
                segments.push(&normalize_email(email));
            }
            if let Some(suffix) = suffix {
                segments.push(suffix);
            }
        }
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        bail!("Remote rejected the API key (set BASKET_REMOTE_KEY)");
    }
    bail!("Remote returned {status}: {}", body.trim())
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn pull(&self, email: &str) -> Result<Option<RemoteBundle>> {
        let resp = self
            .request(reqwest::Method::GET, self.url(Some(email), None)?)
            .send()
            .await
            .context("Failed to reach remote store")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bundle = check(resp)
            .await?
            .json()
            .await
            .context("Failed to parse remote document")?;
        Ok(Some(bundle))
    }

    async fn push(&self, email: &str, bundle: &PersistedBundle) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PUT, self.url(Some(email), None)?)
            .json(bundle)
            .send()
            .await
            .context("Failed to reach remote store")?;
        check(resp).await?;
        Ok(())
    }

    async fn exists(&self, email: &str) -> Result<bool> {
        let resp = self
            .request(reqwest::Method::GET, self.url(Some(email), Some("exists"))?)
            .send()
            .await
            .context("Failed to reach remote store")?;
        let data: ExistsResponse = check(resp)
            .await?
            .json()
            .await
            .context("Failed to parse remote response")?;
        Ok(data.exists)
    }

    async fn list_all(&self) -> Result<Vec<UserProfile>> {
        let resp = self
            .request(reqwest::Method::GET, self.url(None, None)?)
            .send()
            .await
            .context("Failed to reach remote store")?;
        check(resp)
            .await?
            .json()
            .await
            .context("Failed to parse remote response")
    }
}
