//! Data model shared by every stage of a mapping run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire marker for a requirement that can only be assessed by hand.
pub const MANUAL_ONLY: &str = "manual_only";

// =============================================================================
// REQUIREMENTS
// =============================================================================

/// Whether a requirement is expected to be automatable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssessmentKind {
    #[default]
    #[serde(alias = "automated", alias = "AUTOMATED")]
    Automated,
    #[serde(alias = "manual", alias = "MANUAL")]
    Manual,
}

impl AssessmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentKind::Automated => "Automated",
            AssessmentKind::Manual => "Manual",
        }
    }
}

/// One control from the benchmark being mapped.
///
/// Any field beyond the recognized ones (description, rationale, audit
/// procedure, ...) is kept verbatim in `context` and shown to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "assessment_status", alias = "assessment")]
    pub assessment_kind: AssessmentKind,
    /// Functions already attached to this requirement by an earlier run.
    #[serde(default, alias = "function_names", alias = "checks")]
    pub existing_function_names: Vec<String>,
    #[serde(flatten)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Requirement {
    pub fn new(id: impl Into<String>, title: impl Into<String>, kind: AssessmentKind) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            assessment_kind: kind,
            existing_function_names: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    pub fn with_existing(mut self, names: &[&str]) -> Self {
        self.existing_function_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn is_manual(&self) -> bool {
        self.assessment_kind == AssessmentKind::Manual
    }

    /// Title plus every textual context value, lowercased. Used for relevance
    /// ranking of catalog names.
    pub fn search_text(&self) -> String {
        let mut text = self.title.to_lowercase();
        for value in self.context.values() {
            text.push(' ');
            match value {
                serde_json::Value::String(s) => text.push_str(&s.to_lowercase()),
                other => text.push_str(&other.to_string().to_lowercase()),
            }
        }
        text
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// A check function the mapper may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub canonical_name: String,
    #[serde(default, alias = "service")]
    pub service_tag: String,
    #[serde(default)]
    pub description: String,
    /// Retired names that still resolve to this entry.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aliases: BTreeSet<String>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, service_tag: impl Into<String>) -> Self {
        Self {
            canonical_name: name.into(),
            service_tag: service_tag.into(),
            description: String::new(),
            aliases: BTreeSet::new(),
        }
    }
}

/// A new check function suggested by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFunctionProposal {
    pub name: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, alias = "service")]
    pub service_tag: String,
    /// Example API call the check would make (e.g. "s3.get_bucket_policy").
    #[serde(default, alias = "api", alias = "boto3_api")]
    pub api_example: String,
}

impl NewFunctionProposal {
    pub fn new(name: impl Into<String>, service_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rationale: String::new(),
            service_tag: service_tag.into(),
            api_example: String::new(),
        }
    }

    pub fn to_entry(&self) -> CatalogEntry {
        CatalogEntry {
            canonical_name: self.name.clone(),
            service_tag: self.service_tag.clone(),
            description: self.rationale.clone(),
            aliases: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameSuggestion {
    #[serde(alias = "old", alias = "from")]
    pub old_name: String,
    #[serde(alias = "new", alias = "to")]
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationSuggestion {
    #[serde(alias = "old_functions", alias = "functions")]
    pub old_names: Vec<String>,
    #[serde(alias = "new_consolidated_function")]
    pub new_name: String,
}

// =============================================================================
// COVERAGE
// =============================================================================

/// How completely the mapped functions cover a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coverage {
    /// 1 (no meaningful coverage) through 10 (fully automated).
    Score(u8),
    ManualOnly,
}

impl Coverage {
    pub fn score(&self) -> Option<u8> {
        match self {
            Coverage::Score(s) => Some(*s),
            Coverage::ManualOnly => None,
        }
    }

    pub fn bucket(&self) -> CoverageBucket {
        match self {
            Coverage::ManualOnly => CoverageBucket::ManualOnly,
            Coverage::Score(s) if *s >= 8 => CoverageBucket::High,
            Coverage::Score(s) if *s >= 4 => CoverageBucket::Medium,
            Coverage::Score(_) => CoverageBucket::Low,
        }
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coverage::Score(s) => write!(f, "{s}"),
            Coverage::ManualOnly => f.write_str(MANUAL_ONLY),
        }
    }
}

impl Serialize for Coverage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Coverage::Score(s) => serializer.serialize_u8(*s),
            Coverage::ManualOnly => serializer.serialize_str(MANUAL_ONLY),
        }
    }
}

impl<'de> Deserialize<'de> for Coverage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Score(u8),
            Marker(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Score(s) if (1..=10).contains(&s) => Ok(Coverage::Score(s)),
            Repr::Score(s) => Err(de::Error::custom(format!("coverage {s} outside 1-10"))),
            Repr::Marker(m) if m == MANUAL_ONLY => Ok(Coverage::ManualOnly),
            Repr::Marker(m) => Err(de::Error::custom(format!("unknown coverage marker {m:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageBucket {
    High,
    Medium,
    Low,
    ManualOnly,
}

// =============================================================================
// RESULTS
// =============================================================================

/// Final mapping for one requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingResult {
    pub requirement_id: String,
    pub mapped_existing: Vec<String>,
    pub proposed_new: Vec<NewFunctionProposal>,
    pub rename_suggestions: Vec<RenameSuggestion>,
    pub consolidation_suggestions: Vec<ConsolidationSuggestion>,
    pub coverage_score: Coverage,
    pub notes: String,
    /// Set when automatic mapping gave up and a human has to look at it.
    #[serde(default)]
    pub needs_review: bool,
}

impl MappingResult {
    /// Placeholder for a requirement that could not be mapped automatically.
    pub fn manual_review(requirement_id: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            requirement_id: requirement_id.into(),
            mapped_existing: Vec::new(),
            proposed_new: Vec::new(),
            rename_suggestions: Vec::new(),
            consolidation_suggestions: Vec::new(),
            coverage_score: Coverage::ManualOnly,
            notes: notes.into(),
            needs_review: true,
        }
    }
}

/// Model identifier for one rung of the escalation ladder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelTier(pub String);

impl ModelTier {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the backend sees for one batch. The tier is passed alongside,
/// never inside, so cached answers are shared across tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub requirements: Vec<Requirement>,
    /// Sorted catalog names offered as mapping targets.
    pub catalog_names: Vec<String>,
}

/// Raw backend output: one payload per requirement, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchResponse {
    pub payloads: Vec<serde_json::Value>,
}

impl BatchResponse {
    pub fn new(payloads: Vec<serde_json::Value>) -> Self {
        Self { payloads }
    }
}

// =============================================================================
// RUN SUMMARY
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageBuckets {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub manual_only: usize,
}

impl CoverageBuckets {
    pub fn add(&mut self, coverage: Coverage) {
        match coverage.bucket() {
            CoverageBucket::High => self.high += 1,
            CoverageBucket::Medium => self.medium += 1,
            CoverageBucket::Low => self.low += 1,
            CoverageBucket::ManualOnly => self.manual_only += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.manual_only
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_requirements: usize,
    pub coverage: CoverageBuckets,
    pub new_functions_accepted: usize,
    /// Requirements that ended as manual-only, by choice or by failure.
    pub manual_only: usize,
    /// Subset of `manual_only` produced by exhausted or cancelled batches.
    pub needs_review: usize,
    pub batches: usize,
    pub cache_hits: usize,
    pub cache_hit_ratio: f64,
    pub inference_calls: usize,
    pub escalations: usize,
    pub renames_applied: usize,
    pub catalog_conflicts: usize,
    pub cancelled: bool,
}

/// Output of a complete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRun {
    pub run_id: Uuid,
    pub results: Vec<MappingResult>,
    pub summary: RunSummary,
    pub catalog_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requirement_keeps_unknown_fields_as_context() {
        let req: Requirement = serde_json::from_value(json!({
            "id": "1.4",
            "title": "Ensure no root access keys exist",
            "assessment_status": "Automated",
            "description": "Root keys grant unrestricted access.",
            "rationale": "Least privilege."
        }))
        .unwrap();

        assert_eq!(req.assessment_kind, AssessmentKind::Automated);
        assert_eq!(req.context.len(), 2);
        assert!(req.search_text().contains("least privilege"));
        assert!(req.existing_function_names.is_empty());
    }

    #[test]
    fn assessment_kind_defaults_to_automated() {
        assert_eq!(AssessmentKind::default(), AssessmentKind::Automated);
        let req: Requirement = serde_json::from_value(json!({"id": "2.1"})).unwrap();
        assert_eq!(req.assessment_kind, AssessmentKind::Automated);
        let manual: Requirement =
            serde_json::from_value(json!({"id": "2.2", "assessment_kind": "manual"})).unwrap();
        assert!(manual.is_manual());
    }

    #[test]
    fn coverage_serializes_as_score_or_marker() {
        assert_eq!(serde_json::to_value(Coverage::Score(7)).unwrap(), json!(7));
        assert_eq!(
            serde_json::to_value(Coverage::ManualOnly).unwrap(),
            json!("manual_only")
        );
        let parsed: Coverage = serde_json::from_value(json!("manual_only")).unwrap();
        assert_eq!(parsed, Coverage::ManualOnly);
        assert!(serde_json::from_value::<Coverage>(json!(11)).is_err());
        assert!(serde_json::from_value::<Coverage>(json!(0)).is_err());
    }

    #[test]
    fn coverage_buckets() {
        assert_eq!(Coverage::Score(10).bucket(), CoverageBucket::High);
        assert_eq!(Coverage::Score(8).bucket(), CoverageBucket::High);
        assert_eq!(Coverage::Score(7).bucket(), CoverageBucket::Medium);
        assert_eq!(Coverage::Score(4).bucket(), CoverageBucket::Medium);
        assert_eq!(Coverage::Score(3).bucket(), CoverageBucket::Low);
        assert_eq!(Coverage::ManualOnly.bucket(), CoverageBucket::ManualOnly);

        let mut buckets = CoverageBuckets::default();
        buckets.add(Coverage::Score(9));
        buckets.add(Coverage::ManualOnly);
        assert_eq!(buckets.total(), 2);
    }

    #[test]
    fn proposal_accepts_legacy_field_names() {
        let p: NewFunctionProposal = serde_json::from_value(json!({
            "name": "s3_bucket_policy_denies_http",
            "service": "s3",
            "boto3_api": "s3.get_bucket_policy",
            "rationale": "Enforce TLS"
        }))
        .unwrap();
        assert_eq!(p.service_tag, "s3");
        assert_eq!(p.api_example, "s3.get_bucket_policy");
    }
}
