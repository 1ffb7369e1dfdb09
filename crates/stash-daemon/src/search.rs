use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use stash_proto::config::SearchConfig;
use stash_proto::stations::{StationCollection, StationRecord};
use stash_proto::Result;

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// A directory hit, flagged when the URL is already saved.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchResult {
    #[serde(flatten)]
    pub station: StationRecord,
    pub saved: bool,
}

/// Station as returned by the radio-browser API.  Only the fields we keep.
#[derive(Debug, Deserialize)]
struct DirectoryStation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    /// Comma-separated, no spaces.
    #[serde(default)]
    tags: String,
}

impl From<DirectoryStation> for StationRecord {
    fn from(hit: DirectoryStation) -> Self {
        let tags: Vec<&str> = hit
            .tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        StationRecord::new(hit.url.trim(), hit.name.trim(), tags.join(", "))
    }
}

/// Client for the radio-browser station directory.
pub struct StationSearch {
    client: reqwest::Client,
    endpoint: String,
    limit: u32,
}

impl StationSearch {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(config.user_agent.as_str())
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/json/stations/search",
                config.base_url.trim_end_matches('/')
            ),
            limit: config.limit,
        })
    }

    /// Stations whose name matches `term`.  A blank term returns nothing
    /// without touching the network.
    pub async fn search(&self, term: &str) -> Result<Vec<StationRecord>> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        info!("search: {:?}", term);
        let limit = self.limit.to_string();
        let hits: Vec<DirectoryStation> = self
            .client
            .get(&self.endpoint)
            .query(&[("name", term), ("limit", limit.as_str()), ("hidebroken", "true")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("search: {} hits for {:?}", hits.len(), term);

        Ok(into_records(hits))
    }
}

fn into_records(hits: Vec<DirectoryStation>) -> Vec<StationRecord> {
    hits.into_iter()
        .map(StationRecord::from)
        .filter(|record| !record.url.is_empty())
        .collect()
}

pub fn mark_saved(records: Vec<StationRecord>, collection: &StationCollection) -> Vec<SearchResult> {
    records
        .into_iter()
        .map(|station| SearchResult {
            saved: collection.contains(&station.url),
            station,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"changeuuid":"x","name":" Dublab ","url":"https://dublab.out.airtime.pro/dublab_a","tags":"eclectic,experimental,los angeles","votes":10},
        {"name":"No stream","url":"","tags":""},
        {"name":"Bare","url":"https://bare/live"}
    ]"#;

    #[test]
    fn tags_become_description() {
        let hits: Vec<DirectoryStation> = serde_json::from_str(SAMPLE).unwrap();
        let records = into_records(hits);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Dublab");
        assert_eq!(records[0].description, "eclectic, experimental, los angeles");
        assert_eq!(records[1].description, "");
    }

    #[test]
    fn saved_flag_follows_collection() {
        let collection = StationCollection::with_stations(
            "anonymous",
            vec![StationRecord::new("https://bare/live", "", "")],
        );
        let hits: Vec<DirectoryStation> = serde_json::from_str(SAMPLE).unwrap();
        let results = mark_saved(into_records(hits), &collection);
        assert!(!results[0].saved);
        assert!(results[1].saved);

        let json = serde_json::to_value(&results[1]).unwrap();
        assert_eq!(json["url"], "https://bare/live");
        assert_eq!(json["saved"], true);
    }

    #[tokio::test]
    async fn blank_term_skips_network() {
        let search = StationSearch::new(&SearchConfig {
            base_url: "http://127.0.0.1:9".into(),
            ..SearchConfig::default()
        })
        .unwrap();
        assert!(search.search("   ").await.unwrap().is_empty());
    }
}
