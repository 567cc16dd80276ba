//! Offline post source backed by a JSON fixture file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_stream::stream;
use redscrape_core::SourcePost;
use serde::{Deserialize, Serialize};

use crate::{PostSource, PostStream, SourceError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub communities: BTreeMap<String, FixtureCommunity>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureCommunity {
    #[serde(default)]
    pub forbidden: bool,
    #[serde(default)]
    pub posts: Vec<SourcePost>,
}

/// Serves each community's posts newest first; counts every post handed out.
#[derive(Debug, Default)]
pub struct FixturePostSource {
    fixture: FixtureFile,
    pulled: AtomicUsize,
}

impl FixturePostSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let fixture: FixtureFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(fixture))
    }

    pub fn new(mut fixture: FixtureFile) -> Self {
        for community in fixture.communities.values_mut() {
            community
                .posts
                .sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        }
        Self {
            fixture,
            pulled: AtomicUsize::new(0),
        }
    }

    pub fn with_posts(mut self, community: &str, posts: Vec<SourcePost>) -> Self {
        self.fixture.communities.insert(
            community.to_string(),
            FixtureCommunity {
                forbidden: false,
                posts,
            },
        );
        Self::new(self.fixture)
    }

    pub fn with_forbidden(mut self, community: &str) -> Self {
        self.fixture.communities.insert(
            community.to_string(),
            FixtureCommunity {
                forbidden: true,
                posts: Vec::new(),
            },
        );
        self
    }

    pub fn communities(&self) -> impl Iterator<Item = &str> {
        self.fixture.communities.keys().map(String::as_str)
    }

    /// Posts handed to consumers so far, across all streams.
    pub fn posts_pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    fn lookup(&self, community: &str) -> Option<&FixtureCommunity> {
        self.fixture.communities.get(community).or_else(|| {
            self.fixture
                .communities
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(community))
                .map(|(_, c)| c)
        })
    }
}

impl PostSource for FixturePostSource {
    fn new_posts<'a>(&'a self, community: &'a str) -> PostStream<'a> {
        Box::pin(stream! {
            match self.lookup(community) {
                None => {
                    yield Err(SourceError::NotFound(community.to_string()));
                }
                Some(c) if c.forbidden => {
                    yield Err(SourceError::Forbidden(community.to_string()));
                }
                Some(c) => {
                    for post in &c.posts {
                        self.pulled.fetch_add(1, Ordering::SeqCst);
                        yield Ok(post.clone());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn post(id: &str, created_utc: i64) -> SourcePost {
        SourcePost {
            id: id.into(),
            author: Some("ferris".into()),
            title: id.into(),
            selftext: String::new(),
            permalink: format!("/r/rust/comments/{id}/"),
            created_utc,
            score: 0,
            num_comments: 0,
        }
    }

    #[tokio::test]
    async fn posts_come_out_newest_first_and_lazily() {
        let source = FixturePostSource::default()
            .with_posts("rust", vec![post("a", 10), post("c", 30), post("b", 20)]);
        let mut stream = source.new_posts("Rust");
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, "c");
        assert_eq!(source.posts_pulled(), 1);
        drop(stream);

        let all: Vec<_> = source.new_posts("rust").collect().await;
        assert_eq!(all.len(), 3);
        assert_eq!(source.posts_pulled(), 4);
    }

    #[tokio::test]
    async fn unknown_and_forbidden_communities_fail_once() {
        let source = FixturePostSource::default().with_forbidden("private");

        let items: Vec<_> = source.new_posts("missing").collect().await;
        assert!(matches!(items.as_slice(), [Err(SourceError::NotFound(c))] if c == "missing"));

        let items: Vec<_> = source.new_posts("private").collect().await;
        assert!(matches!(items.as_slice(), [Err(SourceError::Forbidden(_))]));
    }
}
