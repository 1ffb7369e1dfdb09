use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use stash_proto::config::RemoteConfig;
use stash_proto::persistence::encode_collection;
use stash_proto::stations::StationCollection;
use stash_proto::Result;

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// One JSON document per account, holding that account's station list.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The stored document, or `None` when the account has none yet.
    async fn read(&self, account: &str) -> Result<Option<String>>;

    async fn create(&self, account: &str, collection: &StationCollection) -> Result<()>;

    async fn update(&self, account: &str, collection: &StationCollection) -> Result<()>;
}

/// PostgREST table (the Supabase REST shape): one row per account with an
/// `email` column and a `data` column holding the serialized list as a
/// string.
pub struct RestRemoteStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct Row {
    data: Value,
}

impl RestRemoteStore {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/rest/v1/{}",
                config.base_url.trim_end_matches('/'),
                config.table
            ),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.client
            .request(method, &self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

}

/// The raw document in a row.  Rows are written with the serialized list as
/// a string; an object stored directly in a json column is accepted too.
fn row_payload(row: Row) -> String {
    match row.data {
        Value::String(raw) => raw,
        other => other.to_string(),
    }
}

fn email_filter(account: &str) -> String {
    format!("eq.{}", account)
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn read(&self, account: &str) -> Result<Option<String>> {
        debug!("remote: read {}", account);
        let rows: Vec<Row> = self
            .request(reqwest::Method::GET)
            .query(&[
                ("select", "data"),
                ("email", email_filter(account).as_str()),
                ("limit", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows.into_iter().next().map(row_payload))
    }

    async fn create(&self, account: &str, collection: &StationCollection) -> Result<()> {
        info!("remote: creating document for {}", account);
        self.request(reqwest::Method::POST)
            .json(&json!({ "email": account, "data": encode_collection(collection)? }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn update(&self, account: &str, collection: &StationCollection) -> Result<()> {
        debug!("remote: update {} ({} stations)", account, collection.len());
        self.request(reqwest::Method::PATCH)
            .query(&[("email", email_filter(account))])
            .json(&json!({ "data": encode_collection(collection)? }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// The configured remote store, if any.  A client that cannot be built
/// disables mirroring instead of failing startup.
pub fn from_config(config: &RemoteConfig) -> Option<Arc<dyn RemoteStore>> {
    if !config.is_active() {
        info!("remote: not configured, signed-in lists stay local");
        return None;
    }
    match RestRemoteStore::new(config) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("remote: disabled, client setup failed: {}", e);
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base_and_table() {
        let store = RestRemoteStore::new(&RemoteConfig {
            enabled: true,
            base_url: "https://example.supabase.co/".into(),
            api_key: "k".into(),
            table: "stations".into(),
            debounce_ms: 500,
        })
        .unwrap();
        assert_eq!(store.endpoint, "https://example.supabase.co/rest/v1/stations");
    }

    fn decode_first(body: &str) -> StationCollection {
        let rows: Vec<Row> = serde_json::from_str(body).unwrap();
        let raw = rows.into_iter().next().map(row_payload).unwrap();
        stash_proto::persistence::decode_collection("a@b", &raw).unwrap()
    }

    #[test]
    fn string_row_data_is_the_document() {
        let decoded = decode_first(
            r#"[{"data":"{\"owner\":\"a@b\",\"stations\":[{\"url\":\"https://x\",\"name\":\"X\",\"description\":\"\"}]}"}]"#,
        );
        assert_eq!(decoded.list()[0].url, "https://x");
        assert_eq!(decoded.list()[0].name, "X");
    }

    #[test]
    fn object_row_data_is_accepted() {
        let decoded = decode_first(
            r#"[{"data":{"owner":"a@b","stations":[{"url":"https://x","name":"X","description":""}]}}]"#,
        );
        assert_eq!(decoded.list()[0].url, "https://x");
    }

    #[test]
    fn written_payload_is_a_string() {
        let collection = StationCollection::with_stations(
            "a@b",
            vec![stash_proto::stations::StationRecord::new("https://x", "X", "")],
        );
        let body = json!({ "email": "a@b", "data": encode_collection(&collection).unwrap() });
        let raw = body["data"].as_str().unwrap();
        assert_eq!(
            stash_proto::persistence::decode_collection("a@b", raw).unwrap(),
            collection
        );
    }

    #[test]
    fn inactive_config_builds_no_store() {
        assert!(from_config(&RemoteConfig::default()).is_none());
    }
}
