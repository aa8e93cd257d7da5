use crate::error::{Context, Result};
use serde::Serialize;
use std::fmt;
use url::Url;

/// A candidate base endpoint and its position in the fallback ring (0 is the primary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EndpointRef {
    pub position: usize,
    pub url: String,
}

impl EndpointRef {
    pub fn is_primary(&self) -> bool {
        self.position == 0
    }

    /// Appends an absolute request path to the base URL.
    pub fn join(&self, path: &str) -> String {
        let base = self.url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// `[primary, fallback_1, .., fallback_n]`; advancing past the last fallback wraps to the primary.
#[derive(Debug, Clone)]
pub struct EndpointRing {
    urls: Vec<String>,
}

impl EndpointRing {
    pub fn new<I, S>(primary: &str, fallbacks: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut urls = vec![normalize(primary)?];
        for fallback in fallbacks {
            let url = normalize(fallback.as_ref())?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(Self { urls })
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn primary(&self) -> EndpointRef {
        self.at(0)
    }

    /// Position is taken modulo the ring length.
    pub fn at(&self, position: usize) -> EndpointRef {
        let position = position % self.urls.len();
        EndpointRef {
            position,
            url: self.urls[position].clone(),
        }
    }

    pub fn next_after(&self, position: usize) -> EndpointRef {
        self.at(position + 1)
    }

    pub fn position_of(&self, url: &str) -> Option<usize> {
        let trimmed = url.trim_end_matches('/');
        self.urls.iter().position(|candidate| candidate == trimmed)
    }

    pub fn iter(&self) -> impl Iterator<Item = EndpointRef> + '_ {
        (0..self.urls.len()).map(|position| self.at(position))
    }
}

fn normalize(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).with_context(|| format!("invalid endpoint url `{raw}`"))?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}
