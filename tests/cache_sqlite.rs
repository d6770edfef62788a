use control_mapper::cache::{BatchCache, BatchCacheKey, JsonlBatchCache, SqliteBatchCache};
use control_mapper::{AssessmentKind, BatchRequest, BatchResponse, ModelTier, Requirement};
use serde_json::json;
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct ExportRow {
    key_hash: String,
    tier: String,
    hit_count: i64,
}

fn key(id: &str) -> BatchCacheKey {
    BatchCacheKey::new(&BatchRequest {
        requirements: vec![
            Requirement::new(id, "Ensure KMS key rotation", AssessmentKind::Automated)
                .with_context("description", "Rotate customer managed keys yearly"),
        ],
        catalog_names: vec!["kms_key_rotation_enabled".to_string()],
    })
}

fn response() -> BatchResponse {
    BatchResponse::new(vec![json!({
        "requirement_id": "3.8",
        "existing_functions": ["kms_key_rotation_enabled"],
        "coverage": 10,
        "new_functions": [],
        "notes": ""
    })])
}

#[tokio::test]
async fn sqlite_cache_put_get_and_export_counts_hits() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteBatchCache::new(&db_path).unwrap();
    let key = key("3.8");

    assert!(cache.get(&key).await.unwrap().is_none());
    cache
        .put(&key, &ModelTier::new("tier/cheap"), &response())
        .await
        .unwrap();

    let hit = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit.response, response());
    assert_eq!(hit.requirements_hash, key.requirements_hash);
    let _ = cache.get(&key).await.unwrap().unwrap();

    let export_path = dir.path().join("export.jsonl");
    let written = cache.export_jsonl(&export_path).await.unwrap();
    assert_eq!(written, 1);

    let raw = std::fs::read_to_string(&export_path).unwrap();
    let rows: Vec<ExportRow> = raw
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key_hash, key.key_hash);
    assert_eq!(rows[0].tier, "tier/cheap");
    assert_eq!(rows[0].hit_count, 2);
}

#[tokio::test]
async fn sqlite_export_replays_as_jsonl_cache() {
    let dir = tempdir().unwrap();
    let cache = SqliteBatchCache::new(dir.path().join("cache.db")).unwrap();
    cache
        .put(&key("3.8"), &ModelTier::new("tier/strong"), &response())
        .await
        .unwrap();
    cache
        .put(&key("3.9"), &ModelTier::new("tier/cheap"), &response())
        .await
        .unwrap();

    let export_path = dir.path().join("export.jsonl");
    cache.export_jsonl(&export_path).await.unwrap();

    let replayed = JsonlBatchCache::open(&export_path).unwrap();
    assert_eq!(replayed.replay_stats().loaded, 2);
    assert_eq!(replayed.replay_stats().skipped, 0);
    let hit = replayed.get(&key("3.8")).await.unwrap().unwrap();
    assert_eq!(hit.tier, ModelTier::new("tier/strong"));
}

#[tokio::test]
async fn sqlite_first_writer_wins() {
    let dir = tempdir().unwrap();
    let cache = SqliteBatchCache::new(dir.path().join("cache.sqlite")).unwrap();
    let key = key("3.8");

    cache
        .put(&key, &ModelTier::new("tier/cheap"), &response())
        .await
        .unwrap();
    cache
        .put(&key, &ModelTier::new("tier/strong"), &BatchResponse::new(vec![json!({})]))
        .await
        .unwrap();

    let hit = cache.get(&key).await.unwrap().unwrap();
    assert_eq!(hit.tier, ModelTier::new("tier/cheap"));
    assert_eq!(hit.response, response());
}

#[test]
fn sqlite_cache_lock_does_not_truncate_lockfile() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cache.sqlite");
    let cache = SqliteBatchCache::new(&db_path).unwrap();

    let mut lock_path = db_path.clone();
    lock_path.set_extension("lock");
    std::fs::write(&lock_path, "keep").unwrap();

    let lock = cache.lock_exclusive().unwrap();
    drop(lock);

    assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), "keep");
}
