//! Compose a news digest for a configured source
//!
//! Feed entries come from a JSON file (`[{"title": ..., "link": ...}]`), and
//! room history from a text file of earlier message bodies. Links already in
//! the history are not posted again.

use super::config::{default_config_path, CourierConfig};
use courier::news::{compose_digest, extract_links, Digest, FeedEntry};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A digest and the room it goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDigest {
    pub room_id: String,
    pub digest: Digest,
}

pub fn execute(
    config_path: Option<String>,
    source: String,
    entries_path: String,
    history_path: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = CourierConfig::load(&config_path)?;

    let entries = read_entries(Path::new(&entries_path))?;
    let history = match history_path {
        Some(path) => fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read history '{}': {}", path, e))?,
        None => String::new(),
    };

    match build_digest(&config, &source, &entries, &history)? {
        Some(RoomDigest { room_id, digest }) => {
            println!("📰 {} -> {}", source, room_id);
            println!();
            print!("{}", digest.body);
        }
        None => println!("No new entries for {}", source),
    }

    Ok(())
}

/// Digest for `source`, or `None` when every entry was already posted
pub fn build_digest(
    config: &CourierConfig,
    source: &str,
    entries: &[FeedEntry],
    history: &str,
) -> Result<Option<RoomDigest>, Box<dyn std::error::Error>> {
    let news = config.news.get(source).ok_or_else(|| {
        let known: Vec<&str> = config.news.keys().map(String::as_str).collect();
        format!(
            "Unknown news source '{}' (configured: {})",
            source,
            if known.is_empty() {
                "none".to_string()
            } else {
                known.join(", ")
            }
        )
    })?;

    // `room` may name a `[rooms]` alias or be a room id itself
    let room_id = config
        .room_id(&news.room)
        .unwrap_or(news.room.as_str())
        .to_string();
    let existing: HashSet<String> = extract_links(history).into_iter().collect();

    Ok(compose_digest(source, entries, &existing).map(|digest| RoomDigest { room_id, digest }))
}

fn read_entries(path: &Path) -> Result<Vec<FeedEntry>, Box<dyn std::error::Error>> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read entries '{}': {}", path.display(), e))?;
    let entries = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse entries '{}': {}", path.display(), e))?;
    Ok(entries)
}
