//! Post sources for the collector: the live Reddit API client and a fixture-backed stand-in.

mod client;
mod fixture;
mod http;

use futures_util::stream::BoxStream;
use redscrape_core::SourcePost;
use thiserror::Error;

pub use client::{ListingPage, RedditClient};
pub use fixture::{FixtureCommunity, FixtureFile, FixturePostSource};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition,
    SimpleTokenBucket, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "redscrape-reddit";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("community r/{0} was not found")]
    NotFound(String),
    #[error("access to r/{0} is forbidden")]
    Forbidden(String),
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

pub type PostStream<'a> = BoxStream<'a, Result<SourcePost, SourceError>>;

/// Anything that can list a community's posts, newest first.
///
/// Each call starts a fresh stream. Streams are lazy: pages are fetched only as
/// items are pulled, so dropping a stream stops further requests. An error item
/// ends the stream.
pub trait PostSource: Send + Sync {
    fn new_posts<'a>(&'a self, community: &'a str) -> PostStream<'a>;
}
