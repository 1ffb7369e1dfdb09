use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StashError};

/// Owner identity used before anyone signs in.
pub const ANONYMOUS: &str = "anonymous";

/// One saved stream.  The `url` is the identity of the record; there is no
/// separate id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StationRecord {
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl StationRecord {
    pub fn new(url: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            description: description.into(),
        }
    }

    /// Display name, falling back to the URL's host when the name is empty,
    /// and to the raw URL when even that can't be parsed.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        host_of(&self.url).unwrap_or_else(|e| {
            debug!("label fallback: {}", e);
            self.url.clone()
        })
    }

    /// `host + path` line shown under the label.
    pub fn location(&self) -> String {
        match parse_absolute(&self.url) {
            Ok(parsed) => format!("{}{}", host_with_port(&parsed), parsed.path()),
            Err(_) => self.url.clone(),
        }
    }
}

/// The ordered, URL-keyed list of saved stations for one owner.
/// Insertion order is display order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationCollection {
    pub owner: String,
    pub stations: Vec<StationRecord>,
}

impl Default for StationCollection {
    fn default() -> Self {
        Self::empty(ANONYMOUS)
    }
}

impl StationCollection {
    pub fn empty(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            stations: Vec::new(),
        }
    }

    pub fn with_stations(owner: impl Into<String>, stations: Vec<StationRecord>) -> Self {
        Self {
            owner: owner.into(),
            stations,
        }
    }

    pub fn list(&self) -> &[StationRecord] {
        &self.stations
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&StationRecord> {
        self.stations.iter().find(|s| s.url == url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.position(url).is_some()
    }

    fn position(&self, url: &str) -> Option<usize> {
        self.stations.iter().position(|s| s.url == url)
    }

    /// Append a record.  URL equality is exact string comparison.
    pub fn add(&mut self, record: StationRecord) -> Result<()> {
        if record.url.trim().is_empty() {
            return Err(StashError::EmptyUrl);
        }
        if self.contains(&record.url) {
            return Err(StashError::DuplicateStation { url: record.url });
        }
        self.stations.push(record);
        Ok(())
    }

    /// Overwrite the record currently keyed by `original_url`, keeping its
    /// position even when the URL itself changes.
    pub fn update(&mut self, original_url: &str, record: StationRecord) -> Result<()> {
        let idx = self
            .position(original_url)
            .ok_or_else(|| StashError::StationNotFound {
                url: original_url.to_string(),
            })?;
        if record.url.trim().is_empty() {
            return Err(StashError::EmptyUrl);
        }
        if record.url != original_url {
            let clash = self
                .stations
                .iter()
                .enumerate()
                .any(|(i, s)| i != idx && s.url == record.url);
            if clash {
                return Err(StashError::DuplicateStation { url: record.url });
            }
        }
        self.stations[idx] = record;
        Ok(())
    }

    /// Remove the record with this URL.  Returns whether anything was removed;
    /// a missing URL is not an error.
    pub fn delete(&mut self, url: &str) -> bool {
        let before = self.stations.len();
        self.stations.retain(|s| s.url != url);
        self.stations.len() != before
    }

    /// Re-check the collection invariants after deserializing untrusted data.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for station in &self.stations {
            if station.url.trim().is_empty() {
                return Err(StashError::persistence("stored station has an empty url"));
            }
            if !seen.insert(station.url.as_str()) {
                return Err(StashError::persistence(format!(
                    "stored stations contain duplicate url {}",
                    station.url
                )));
            }
        }
        Ok(())
    }
}

// ── URL helpers ───────────────────────────────────────────────────────────────

fn parse_absolute(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw).map_err(|e| StashError::MalformedUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.host_str().is_none() {
        return Err(StashError::MalformedUrl {
            url: raw.to_string(),
            reason: "no host".to_string(),
        });
    }
    Ok(parsed)
}

fn host_with_port(parsed: &url::Url) -> String {
    let host = parsed.host_str().unwrap_or_default();
    match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Host (with explicit port, if any) of an absolute URL.
pub fn host_of(raw: &str) -> Result<String> {
    parse_absolute(raw).map(|parsed| host_with_port(&parsed))
}

// ── seed list ─────────────────────────────────────────────────────────────────

const SEED: &[(&str, &str, &str)] = &[
    ("https://stream.rovr.live/live-01", "", ""),
    ("https://stream.rovr.live/live-02", "", ""),
    ("https://n10as.radiocult.fm/stream", "", ""),
    ("https://dublab.out.airtime.pro/dublab_a", "", ""),
    ("https://dublab.out.airtime.pro/dublab_b", "", ""),
    ("https://dublab.out.airtime.pro/dublab_c", "", ""),
    ("https://stream-relay-geo.ntslive.net/stream", "Channel 1", "live"),
    ("https://stream-relay-geo.ntslive.net/stream2", "Channel 2", "live"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape4", "Poolside", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape", "Slow Focus", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape2", "Low Key", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape6", "Memory Lane", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape5", "4 To The Floor", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape21", "Island Time", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape26", "The Tube", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape35", "Sheet Music", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape27", "Feelings", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape3", "Expansions", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape22", "Rap House", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape31", "Labyrinth", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape24", "Sweat", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape36", "Otaku", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape34", "The Pit", "mixtape"),
    ("https://stream-mixtape-geo.ntslive.net/mixtape23", "Field Recordings", "mixtape"),
];

/// The built-in station list.
pub fn builtin_seed() -> Vec<StationRecord> {
    SEED.iter()
        .map(|(url, name, description)| StationRecord::new(*url, *name, *description))
        .collect()
}

/// Seed list from a user `stations.toml`, or the built-in list when the file
/// is absent or unusable.
pub fn load_seed(path: &std::path::Path) -> Vec<StationRecord> {
    if !path.exists() {
        return builtin_seed();
    }
    match std::fs::read_to_string(path)
        .map_err(StashError::from)
        .and_then(|content| parse_stations_from_toml_str(&content))
    {
        Ok(stations) if !stations.is_empty() => {
            debug!("seed: {} stations from {}", stations.len(), path.display());
            stations
        }
        Ok(_) => {
            warn!("seed file {} has no stations, using built-in list", path.display());
            builtin_seed()
        }
        Err(e) => {
            warn!("seed file {} unusable ({}), using built-in list", path.display(), e);
            builtin_seed()
        }
    }
}

// ── TOML / m3u readers ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<StationRecord>,
}

pub fn parse_stations_from_toml_str(content: &str) -> Result<Vec<StationRecord>> {
    let file: TomlStationFile = toml::from_str(content)
        .map_err(|e| StashError::persistence(format!("invalid stations.toml: {}", e)))?;
    let collection = StationCollection::with_stations(ANONYMOUS, file.station);
    collection.validate()?;
    Ok(collection.stations)
}

/// Records from an extended m3u playlist.  `#EXTINF` titles become names;
/// other comment lines are ignored.
pub fn parse_m3u_from_str(content: &str) -> Vec<StationRecord> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending_name = rest.split_once(',').map(|(_, name)| name.trim().to_string());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        stations.push(StationRecord::new(
            line,
            pending_name.take().unwrap_or_default(),
            "",
        ));
    }

    stations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(url: &str) -> StationRecord {
        StationRecord::new(url, "", "")
    }

    #[test]
    fn add_rejects_duplicate_and_keeps_collection() {
        let mut c = StationCollection::empty(ANONYMOUS);
        c.add(rec("https://a/b")).unwrap();
        let err = c.add(rec("https://a/b")).unwrap_err();
        assert!(matches!(err, StashError::DuplicateStation { ref url } if url == "https://a/b"));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn add_rejects_blank_url() {
        let mut c = StationCollection::empty(ANONYMOUS);
        assert!(matches!(c.add(rec("   ")), Err(StashError::EmptyUrl)));
        assert!(c.is_empty());
    }

    #[test]
    fn url_equality_is_exact() {
        let mut c = StationCollection::empty(ANONYMOUS);
        c.add(rec("https://a/b")).unwrap();
        c.add(rec("https://a/b/")).unwrap();
        c.add(rec("HTTPS://a/b")).unwrap();
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn update_renames_in_place() {
        let mut c = StationCollection::with_stations(
            ANONYMOUS,
            vec![rec("https://one"), rec("https://old"), rec("https://three")],
        );
        c.update("https://old", StationRecord::new("https://new", "X", ""))
            .unwrap();
        let urls: Vec<_> = c.list().iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, ["https://one", "https://new", "https://three"]);
        assert_eq!(c.get("https://new").unwrap().name, "X");
    }

    #[test]
    fn update_missing_is_not_found() {
        let mut c = StationCollection::with_stations(ANONYMOUS, vec![rec("https://one")]);
        let err = c.update("https://gone", rec("https://x")).unwrap_err();
        assert!(matches!(err, StashError::StationNotFound { .. }));
        assert_eq!(c.list(), &[rec("https://one")]);
    }

    #[test]
    fn update_rename_onto_other_record_is_duplicate() {
        let mut c =
            StationCollection::with_stations(ANONYMOUS, vec![rec("https://one"), rec("https://two")]);
        let err = c.update("https://one", rec("https://two")).unwrap_err();
        assert!(matches!(err, StashError::DuplicateStation { .. }));
        assert_eq!(c.list()[0].url, "https://one");
    }

    #[test]
    fn update_keeping_url_only_changes_fields() {
        let mut c = StationCollection::with_stations(ANONYMOUS, vec![rec("https://one")]);
        c.update("https://one", StationRecord::new("https://one", "Renamed", "desc"))
            .unwrap();
        assert_eq!(c.list()[0].name, "Renamed");
        assert_eq!(c.list()[0].description, "desc");
    }

    #[test]
    fn delete_is_idempotent() {
        let mut c =
            StationCollection::with_stations(ANONYMOUS, vec![rec("https://one"), rec("https://two")]);
        assert!(c.delete("https://one"));
        let after_first = c.clone();
        assert!(!c.delete("https://one"));
        assert_eq!(c, after_first);
    }

    #[test]
    fn label_prefers_name_then_host_then_raw() {
        assert_eq!(StationRecord::new("https://x.fm/live", "Named", "").label(), "Named");
        assert_eq!(StationRecord::new("https://x.fm:8000/live", "", "").label(), "x.fm:8000");
        assert_eq!(StationRecord::new("not a url", "", "").label(), "not a url");
    }

    #[test]
    fn location_joins_host_and_path() {
        let r = StationRecord::new("https://dublab.out.airtime.pro/dublab_a?x=1", "", "");
        assert_eq!(r.location(), "dublab.out.airtime.pro/dublab_a");
        assert_eq!(StationRecord::new("garbage", "", "").location(), "garbage");
    }

    #[test]
    fn host_of_rejects_hostless_urls() {
        assert!(matches!(
            host_of("mailto:someone@example.com"),
            Err(StashError::MalformedUrl { .. })
        ));
    }

    #[test]
    fn builtin_seed_is_valid() {
        let seed = builtin_seed();
        assert_eq!(seed.len(), 24);
        StationCollection::with_stations(ANONYMOUS, seed).validate().unwrap();
    }

    #[test]
    fn m3u_names_come_from_extinf() {
        let content = "#EXTM3U\n#EXTINF:-1,Dublab\nhttps://dublab.out.airtime.pro/dublab_a\n\nhttps://bare.example/stream\n";
        let stations = parse_m3u_from_str(content);
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].name, "Dublab");
        assert_eq!(stations[1].name, "");
        assert_eq!(stations[1].url, "https://bare.example/stream");
    }

    #[test]
    fn toml_seed_parses_station_tables() {
        let content = r#"
[[station]]
url = "https://a.example/live"
name = "A"

[[station]]
url = "https://b.example/live"
description = "second"
"#;
        let stations = parse_stations_from_toml_str(content).unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[1].description, "second");
        assert_eq!(stations[1].name, "");
    }

    #[test]
    fn missing_seed_file_uses_builtin() {
        let stations = load_seed(std::path::Path::new("/nonexistent/stash/stations.toml"));
        assert_eq!(stations, builtin_seed());
    }
}
