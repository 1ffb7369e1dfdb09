//! Local store behaviour against a real directory.

use stash_proto::persistence::{storage_key, LocalStore};
use stash_proto::playback::PlaybackPreferences;
use stash_proto::stations::{builtin_seed, StationCollection, StationRecord, ANONYMOUS};
use tempfile::TempDir;

fn sample(owner: &str) -> StationCollection {
    StationCollection::with_stations(
        owner,
        vec![
            StationRecord::new("https://z.example/live", "Zed", "last letter"),
            StationRecord::new("https://a.example/live", "", ""),
        ],
    )
}

#[tokio::test]
async fn saved_collection_loads_back_identically() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    let original = sample("me@example.com");

    store.save_collection(&original).await.unwrap();
    let loaded = store.load_collection("me@example.com", &builtin_seed()).await;

    assert_eq!(loaded, original);
}

#[tokio::test]
async fn identities_are_stored_separately() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    store.save_collection(&sample("me@example.com")).await.unwrap();

    let anon = store.load_collection(ANONYMOUS, &builtin_seed()).await;
    assert_eq!(anon.owner, ANONYMOUS);
    assert_eq!(anon.stations, builtin_seed());
}

#[tokio::test]
async fn corrupted_data_falls_back_to_seed() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    store
        .write(&storage_key(ANONYMOUS), "{\"owner\": \"anonymous\", \"stations\": [")
        .await
        .unwrap();

    let loaded = store.load_collection(ANONYMOUS, &builtin_seed()).await;
    assert_eq!(loaded.stations, builtin_seed());
}

#[tokio::test]
async fn legacy_bare_array_is_accepted() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    store
        .write(
            &storage_key(ANONYMOUS),
            r#"[{"url":"https://legacy.example/stream","name":"Old","description":""}]"#,
        )
        .await
        .unwrap();

    let loaded = store.load_collection(ANONYMOUS, &builtin_seed()).await;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded.list()[0].name, "Old");
}

#[tokio::test]
async fn missing_directory_reads_as_absent() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path().join("not-yet-created"));
    assert_eq!(store.read("stations:anonymous").await.unwrap(), None);
    assert_eq!(store.load_preferences().await, PlaybackPreferences::default());
}

#[tokio::test]
async fn preferences_persist() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    let prefs = PlaybackPreferences {
        volume: 35,
        is_muted: true,
    };
    store.save_preferences(&prefs).await.unwrap();
    assert_eq!(store.load_preferences().await, prefs);
}

#[tokio::test]
async fn lookalike_owners_do_not_overwrite_each_other() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path());
    store.save_collection(&sample("a/b@x")).await.unwrap();
    store
        .save_collection(&StationCollection::with_stations(
            "a_b@x",
            vec![StationRecord::new("https://other.example/live", "", "")],
        ))
        .await
        .unwrap();

    assert_eq!(store.load_collection("a/b@x", &builtin_seed()).await, sample("a/b@x"));
    assert_eq!(store.load_collection("a_b@x", &builtin_seed()).await.len(), 1);
}
