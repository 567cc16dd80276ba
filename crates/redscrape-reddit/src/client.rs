//! OAuth client for the Reddit listing API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use redscrape_core::{RedditConfig, SourcePost};
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition,
    SimpleTokenBucket,
};
use crate::{PostSource, PostStream, SourceError};

/// Refresh the bearer token this long before the server says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<ListingChild>,
}

#[derive(Debug, Deserialize)]
struct ListingChild {
    kind: String,
    data: ApiPost,
}

#[derive(Debug, Deserialize)]
struct ApiPost {
    id: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    permalink: String,
    created_utc: f64,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    num_comments: i64,
}

impl From<ApiPost> for SourcePost {
    fn from(post: ApiPost) -> Self {
        SourcePost {
            id: post.id,
            author: post.author,
            title: post.title,
            selftext: post.selftext,
            permalink: post.permalink,
            created_utc: post.created_utc.trunc() as i64,
            score: post.score,
            num_comments: post.num_comments,
        }
    }
}

/// One page of a community's newest posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub posts: Vec<SourcePost>,
    /// Cursor for the next page, absent on the last one.
    pub after: Option<String>,
}

pub struct RedditClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: Url,
    api_url: Url,
    backoff: BackoffPolicy,
    bucket: Option<Arc<SimpleTokenBucket>>,
    page_size: usize,
    token: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for RedditClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditClient")
            .field("client_id", &self.client_id)
            .field("api_url", &self.api_url.as_str())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl RedditClient {
    /// Build a client and check the credentials by obtaining a token.
    pub async fn connect(config: &RedditConfig) -> Result<Self, SourceError> {
        Self::connect_with(config, HttpClientConfig::default()).await
    }

    pub async fn connect_with(
        config: &RedditConfig,
        http_config: HttpClientConfig,
    ) -> Result<Self, SourceError> {
        let client = Self::new(config, http_config)?;
        client.verify().await?;
        info!(client_id = %client.client_id, "reddit api access verified");
        Ok(client)
    }

    /// Build a client without contacting the API.
    pub fn new(config: &RedditConfig, http_config: HttpClientConfig) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(http_config.timeout)
            .gzip(true)
            .brotli(true)
            // Unknown communities redirect to a search page instead of 404.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let auth_base = base_url(&config.auth_url)?;
        let token_url = auth_base
            .join("api/v1/access_token")
            .map_err(|err| SourceError::InvalidUrl {
                url: config.auth_url.clone(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_url,
            api_url: base_url(&config.api_url)?,
            backoff: http_config.backoff,
            bucket: http_config
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::new(c))),
            page_size: http_config.page_size.clamp(1, 100),
            token: Mutex::new(None),
        })
    }

    /// Obtain a fresh token, failing with [`SourceError::Auth`] on bad credentials.
    pub async fn verify(&self) -> Result<(), SourceError> {
        self.invalidate_token().await;
        self.bearer_token().await.map(|_| ())
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    async fn bearer_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        let token = self.request_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn request_token(&self) -> Result<AccessToken, SourceError> {
        let resp = self
            .send_with_retry(|| {
                self.http
                    .post(self.token_url.clone())
                    .basic_auth(&self.client_id, Some(&self.client_secret))
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body("grant_type=client_credentials")
            })
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SourceError::Auth(format!(
                "token endpoint rejected the client credentials ({status})"
            )));
        }
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                url: self.token_url.to_string(),
            });
        }

        let body = resp.bytes().await?;
        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(|err| SourceError::Decode(err.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(SourceError::Auth(error));
        }
        let value = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SourceError::Auth("token response carried no access_token".into()))?;
        let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(3600));
        debug!(expires_in = lifetime.as_secs(), "obtained reddit access token");

        Ok(AccessToken {
            value,
            expires_at: Instant::now() + lifetime,
        })
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, SourceError> {
        let mut attempt = 0;
        loop {
            if let Some(bucket) = &self.bucket {
                bucket.take().await;
            }
            let retries_left = attempt < self.backoff.max_retries;
            match build().send().await {
                Ok(resp)
                    if retries_left
                        && classify_status(resp.status()) == RetryDisposition::Retryable =>
                {
                    warn!(status = resp.status().as_u16(), attempt, "retrying request");
                }
                Ok(resp) => return Ok(resp),
                Err(err)
                    if retries_left
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable =>
                {
                    warn!(error = %err, attempt, "retrying request");
                }
                Err(err) => return Err(SourceError::Request(err)),
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    fn listing_url(&self, community: &str, after: Option<&str>) -> Result<Url, SourceError> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl {
                url: self.api_url.to_string(),
                reason: "cannot be a base".into(),
            })?
            .pop_if_empty()
            .extend(["r", community, "new"]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_size.to_string());
            query.append_pair("raw_json", "1");
            if let Some(after) = after {
                query.append_pair("after", after);
            }
        }
        Ok(url)
    }

    /// Fetch one page of a community's newest posts.
    pub async fn fetch_page(
        &self,
        community: &str,
        after: Option<&str>,
    ) -> Result<ListingPage, SourceError> {
        let url = self.listing_url(community, after)?;
        let span = info_span!("reddit_listing", community, after = after.unwrap_or(""));
        async {
            let mut reauthorized = false;
            loop {
                let token = self.bearer_token().await?;
                let resp = self
                    .send_with_retry(|| self.http.get(url.clone()).bearer_auth(&token))
                    .await?;
                let status = resp.status();

                if status.is_success() {
                    let body = resp.bytes().await?;
                    return parse_listing(&body);
                }
                if status == StatusCode::UNAUTHORIZED && !reauthorized {
                    // Token revoked or expired early.
                    self.invalidate_token().await;
                    reauthorized = true;
                    continue;
                }
                return Err(match status {
                    StatusCode::NOT_FOUND => SourceError::NotFound(community.to_string()),
                    s if s.is_redirection() => SourceError::NotFound(community.to_string()),
                    StatusCode::FORBIDDEN => SourceError::Forbidden(community.to_string()),
                    StatusCode::UNAUTHORIZED => {
                        SourceError::Auth("listing request rejected the bearer token".into())
                    }
                    s => SourceError::Http {
                        status: s.as_u16(),
                        url: url.to_string(),
                    },
                });
            }
        }
        .instrument(span)
        .await
    }
}

impl PostSource for RedditClient {
    fn new_posts<'a>(&'a self, community: &'a str) -> PostStream<'a> {
        Box::pin(stream! {
            let mut after: Option<String> = None;
            loop {
                let page = match self.fetch_page(community, after.as_deref()).await {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                };
                let exhausted = page.posts.is_empty();
                for post in page.posts {
                    yield Ok(post);
                }
                match page.after {
                    Some(next) if !exhausted => after = Some(next),
                    _ => break,
                }
            }
        })
    }
}

fn base_url(raw: &str) -> Result<Url, SourceError> {
    let mut url = Url::parse(raw).map_err(|err| SourceError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(SourceError::InvalidUrl {
            url: raw.to_string(),
            reason: "cannot be a base".into(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn parse_listing(body: &[u8]) -> Result<ListingPage, SourceError> {
    let listing: Listing =
        serde_json::from_slice(body).map_err(|err| SourceError::Decode(err.to_string()))?;
    let posts = listing
        .data
        .children
        .into_iter()
        .filter(|child| child.kind == "t3")
        .map(|child| SourcePost::from(child.data))
        .collect();
    Ok(ListingPage {
        posts,
        after: listing.data.after,
    })
}
