use std::process::Command;

use control_mapper::cache::{BatchCache, BatchCacheKey, JsonlBatchCache, SqliteBatchCache};
use control_mapper::config::{ENV_BATCH_SIZE, ENV_TIERS};
use control_mapper::{AssessmentKind, BatchRequest, BatchResponse, ModelTier, Requirement};
use serde_json::json;
use tempfile::tempdir;

fn cli() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_control-mapper"));
    cmd.env_remove(ENV_BATCH_SIZE).env_remove(ENV_TIERS);
    cmd
}

#[test]
fn check_config_prints_effective_settings_and_ladder() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mapper.json");
    std::fs::write(
        &path,
        json!({
            "batch_size": 3,
            "escalation": { "tiers": ["tier/a", "tier/b"], "max_attempts": 4 }
        })
        .to_string(),
    )
    .unwrap();

    let output = cli()
        .args(["check-config", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"batch_size\": 3"));
    assert!(stdout.contains("TierLadder(tier/a -> tier/b; attempts=4"));
}

#[test]
fn env_overrides_apply_on_top_of_the_config_file() {
    let output = cli()
        .arg("check-config")
        .env(ENV_TIERS, "tier/x, tier/y")
        .env(ENV_BATCH_SIZE, "9")
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\"batch_size\": 9"));
    assert!(stdout.contains("TierLadder(tier/x -> tier/y;"));
}

#[test]
fn check_config_rejects_an_invalid_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mapper.json");
    std::fs::write(&path, json!({ "batch_size": 0 }).to_string()).unwrap();

    let status = cli()
        .args(["check-config", "--config"])
        .arg(&path)
        .status()
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn cache_export_writes_a_replayable_jsonl_file() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("cache.sqlite");
    let out = dir.path().join("cache.jsonl");

    let request = BatchRequest {
        requirements: vec![Requirement::new(
            "1.1",
            "Ensure MFA is enabled for the root account",
            AssessmentKind::Automated,
        )],
        catalog_names: vec!["iam_root_mfa_enabled".to_string()],
    };
    let key = BatchCacheKey::new(&request);
    {
        let cache = SqliteBatchCache::new(&db).unwrap();
        cache
            .put(
                &key,
                &ModelTier::new("tier/a"),
                &BatchResponse::new(vec![json!({ "requirement_id": "1.1" })]),
            )
            .await
            .unwrap();
    }

    let status = cli()
        .arg("cache-export")
        .arg("--db")
        .arg(&db)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let replayed = JsonlBatchCache::open(&out).unwrap();
    assert_eq!(replayed.len(), 1);
    let hit = replayed.get(&key).await.unwrap().unwrap();
    assert_eq!(hit.response.payloads[0]["requirement_id"], "1.1");
}
