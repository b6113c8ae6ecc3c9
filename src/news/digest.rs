use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// One entry of a fetched feed
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
}

impl FeedEntry {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
        }
    }
}

/// A configured feed and the room its digest goes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsSource {
    pub url: String,
    pub room: String,
}

/// Message body ready to post, plus the links it introduces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub body: String,
    pub new_links: Vec<String>,
}

/// Rewrite `http://` links to `https://`
pub fn upgrade_link(link: &str) -> String {
    match link.strip_prefix("http://") {
        Some(rest) => format!("https://{}", rest),
        None => link.to_string(),
    }
}

/// Build a digest of the entries whose links are not in `existing`.
///
/// Returns `None` when nothing is new. Duplicate links within `entries` are
/// only posted once.
pub fn compose_digest(
    feed_title: &str,
    entries: &[FeedEntry],
    existing: &HashSet<String>,
) -> Option<Digest> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    let mut new_links = Vec::new();

    for entry in entries {
        let link = upgrade_link(&entry.link);
        if existing.contains(&link) || !seen.insert(link.clone()) {
            continue;
        }
        items.push(format!("{}\n{}", entry.title, link));
        new_links.push(link);
    }

    if items.is_empty() {
        debug!(feed = feed_title, "No new entries");
        return None;
    }

    let mut blocks = Vec::with_capacity(items.len() + 2);
    blocks.push(feed_title.to_string());
    blocks.extend(items);
    blocks.push("\n".to_string());

    Some(Digest {
        body: blocks.join("\n\n"),
        new_links,
    })
}

/// Links previously posted in a message body (lines starting with `https://`)
pub fn extract_links(body: &str) -> Vec<String> {
    body.lines()
        .filter(|line| line.starts_with("https://"))
        .map(str::to_string)
        .collect()
}
