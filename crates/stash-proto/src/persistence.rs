//! Durable local storage for station collections and playback preferences.
//!
//! Values are JSON strings stored under string keys, one file per key inside
//! the data directory.  Station lists live under `stations:<owner>`.
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::playback::PlaybackPreferences;
use crate::stations::{StationCollection, StationRecord};

pub const PLAYBACK_KEY: &str = "playback";

pub fn storage_key(owner: &str) -> String {
    format!("stations:{}", owner)
}

/// Shapes this store has written over time: the full `{owner, stations}`
/// object, or just the bare `stations` array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredCollection {
    Full(StationCollection),
    Bare(Vec<StationRecord>),
}

pub fn encode_collection(collection: &StationCollection) -> Result<String> {
    Ok(serde_json::to_string(collection)?)
}

/// Parse and validate a stored payload for `owner`.
pub fn decode_collection(owner: &str, raw: &str) -> Result<StationCollection> {
    let stored: StoredCollection = serde_json::from_str(raw)?;
    let mut collection = match stored {
        StoredCollection::Full(c) => c,
        StoredCollection::Bare(stations) => StationCollection::with_stations(owner, stations),
    };
    collection.validate()?;
    if collection.owner != owner {
        warn!(
            "stored collection owner {:?} differs from key owner {:?}",
            collection.owner, owner
        );
        collection.owner = owner.to_string();
    }
    Ok(collection)
}

/// Key/value store backed by one JSON file per key.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Percent-encoded, so distinct keys never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }

    pub async fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file and rename so readers never see a partial
    /// value.
    pub async fn write(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("local store: wrote {} ({} bytes)", path.display(), value.len());
        Ok(())
    }

    pub async fn save_collection(&self, collection: &StationCollection) -> Result<()> {
        let payload = encode_collection(collection)?;
        self.write(&storage_key(&collection.owner), &payload).await
    }

    /// Load the collection stored for `owner`.  Absent or invalid data yields
    /// the seed list; this never fails.
    pub async fn load_collection(&self, owner: &str, seed: &[StationRecord]) -> StationCollection {
        let key = storage_key(owner);
        match self.read(&key).await {
            Ok(Some(raw)) => match decode_collection(owner, &raw) {
                Ok(collection) => {
                    info!("Loaded {} stations for {}", collection.len(), owner);
                    return collection;
                }
                Err(e) => warn!("Stored stations for {} are invalid, using seed: {}", owner, e),
            },
            Ok(None) => info!("No stored stations for {}, using seed", owner),
            Err(e) => warn!("Failed to read stations for {}, using seed: {}", owner, e),
        }
        StationCollection::with_stations(owner, seed.to_vec())
    }

    pub async fn load_preferences(&self) -> PlaybackPreferences {
        self.load_preferences_or(PlaybackPreferences::default()).await
    }

    /// Saved preferences, or `fallback` when none were saved or they can't
    /// be read.
    pub async fn load_preferences_or(&self, fallback: PlaybackPreferences) -> PlaybackPreferences {
        match self.read(PLAYBACK_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring invalid playback preferences: {}", e);
                fallback
            }),
            Ok(None) => fallback,
            Err(e) => {
                warn!("Failed to read playback preferences: {}", e);
                fallback
            }
        }
    }

    pub async fn save_preferences(&self, prefs: &PlaybackPreferences) -> Result<()> {
        let payload = serde_json::to_string(prefs)?;
        self.write(PLAYBACK_KEY, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StashError;
    use crate::stations::ANONYMOUS;

    #[test]
    fn key_is_prefixed_by_owner() {
        assert_eq!(storage_key(ANONYMOUS), "stations:anonymous");
        assert_eq!(storage_key("me@example.com"), "stations:me@example.com");
    }

    #[test]
    fn decodes_full_shape() {
        let raw = r#"{"owner":"anonymous","stations":[{"url":"https://a","name":"A","description":""}]}"#;
        let c = decode_collection(ANONYMOUS, raw).unwrap();
        assert_eq!(c.owner, "anonymous");
        assert_eq!(c.list()[0].name, "A");
    }

    #[test]
    fn decodes_bare_array_shape() {
        let raw = r#"[{"url":"https://a","name":"","description":""},{"url":"https://b"}]"#;
        let c = decode_collection("me@example.com", raw).unwrap();
        assert_eq!(c.owner, "me@example.com");
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn rejects_duplicate_urls() {
        let raw = r#"[{"url":"https://a"},{"url":"https://a"}]"#;
        assert!(matches!(
            decode_collection(ANONYMOUS, raw),
            Err(StashError::Persistence { .. })
        ));
    }

    #[test]
    fn rejects_wrong_shape() {
        assert!(decode_collection(ANONYMOUS, r#"{"stations": 3}"#).is_err());
        assert!(decode_collection(ANONYMOUS, "not json").is_err());
    }

    #[test]
    fn owner_is_taken_from_key() {
        let raw = r#"{"owner":"someone-else","stations":[]}"#;
        let c = decode_collection("me@example.com", raw).unwrap();
        assert_eq!(c.owner, "me@example.com");
    }

    #[test]
    fn file_names_are_encoded() {
        let store = LocalStore::new("/tmp/stash");
        assert_eq!(
            store.path_for("stations:me@example.com"),
            PathBuf::from("/tmp/stash/stations%3Ame%40example.com.json")
        );
        assert_eq!(store.path_for(PLAYBACK_KEY), PathBuf::from("/tmp/stash/playback.json"));
    }

    #[test]
    fn similar_owners_get_distinct_files() {
        let store = LocalStore::new("/tmp/stash");
        assert_ne!(
            store.path_for(&storage_key("a/b@x")),
            store.path_for(&storage_key("a_b@x"))
        );
        assert_ne!(
            store.path_for(&storage_key("a%2Fb@x")),
            store.path_for(&storage_key("a/b@x"))
        );
    }
}
