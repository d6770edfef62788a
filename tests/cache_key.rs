use control_mapper::cache::BatchCacheKey;
use control_mapper::{BatchRequest, Requirement};
use serde_json::json;

fn parse(value: serde_json::Value) -> Requirement {
    serde_json::from_value(value).unwrap()
}

fn request(requirements: Vec<Requirement>) -> BatchRequest {
    BatchRequest {
        requirements,
        catalog_names: vec![
            "cloudtrail_multi_region_enabled".to_string(),
            "iam_root_mfa_enabled".to_string(),
        ],
    }
}

#[test]
fn key_is_independent_of_input_field_order_and_aliases() {
    let a = parse(json!({
        "id": "3.1",
        "title": "Ensure CloudTrail is enabled in all regions",
        "assessment_status": "Automated",
        "rationale": "Visibility into API activity.",
        "audit": "aws cloudtrail describe-trails",
        "function_names": ["cloudtrail_multi_region_enabled"]
    }));
    let b = parse(json!({
        "audit": "aws cloudtrail describe-trails",
        "existing_function_names": ["cloudtrail_multi_region_enabled"],
        "rationale": "Visibility into API activity.",
        "assessment_kind": "Automated",
        "title": "Ensure CloudTrail is enabled in all regions",
        "id": "3.1"
    }));

    assert_eq!(
        BatchCacheKey::new(&request(vec![a])),
        BatchCacheKey::new(&request(vec![b]))
    );
}

#[test]
fn key_changes_with_context_text_and_catalog() {
    let base = parse(json!({
        "id": "1.5",
        "title": "Ensure MFA is enabled for the root user",
        "description": "Root has unrestricted access."
    }));
    let mut edited = base.clone();
    edited
        .context
        .insert("description".to_string(), json!("Root has full access."));

    let key = BatchCacheKey::new(&request(vec![base.clone()]));
    let edited_key = BatchCacheKey::new(&request(vec![edited]));
    assert_ne!(key.key_hash, edited_key.key_hash);
    assert_eq!(key.catalog_hash, edited_key.catalog_hash);

    let mut grown = request(vec![base]);
    grown
        .catalog_names
        .push("iam_root_hardware_mfa_enabled".to_string());
    let grown_key = BatchCacheKey::new(&grown);
    assert_ne!(key.key_hash, grown_key.key_hash);
    assert_eq!(key.requirements_hash, grown_key.requirements_hash);
}

#[test]
fn duplicate_catalog_names_do_not_change_the_key() {
    let req = parse(json!({ "id": "2.1", "title": "Ensure S3 bucket versioning" }));
    let mut doubled = request(vec![req.clone()]);
    doubled
        .catalog_names
        .push("iam_root_mfa_enabled".to_string());
    assert_eq!(
        BatchCacheKey::new(&request(vec![req])),
        BatchCacheKey::new(&doubled)
    );
}
