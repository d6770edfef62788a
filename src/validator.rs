//! Structural and semantic checks on backend payloads.
//!
//! Per requirement the rules run in a fixed order and stop at the first
//! failing rule: required fields, existing-function resolution, coverage,
//! proposals. Batch-level checks (payload count, echoed ids, proposals
//! duplicated across requirements) run in `validate_batch`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::catalog::Catalog;
use crate::types::{
    BatchResponse, ConsolidationSuggestion, Coverage, NewFunctionProposal, RenameSuggestion,
    Requirement, MANUAL_ONLY,
};

/// `<service>_<resource>_<condition>`: lowercase snake case, three or more
/// segments.
static CANONICAL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(?:_[a-z0-9]+){2,}$").expect("canonical name regex")
});

pub fn is_canonical_name(name: &str) -> bool {
    CANONICAL_NAME.is_match(name)
}

// =============================================================================
// OUTCOMES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    LengthMismatch { expected: usize, actual: usize },
    RequirementMismatch { expected: String, actual: String },
    MissingField { requirement_id: String, field: String },
    MalformedField { requirement_id: String, field: String, detail: String },
    UnknownExistingFunction { requirement_id: String, name: String },
    InvalidCoverage { requirement_id: String, value: String },
    ManualOnlyNotAllowed { requirement_id: String },
    InvalidFunctionName { requirement_id: String, name: String },
    ProposalAlreadyExists { requirement_id: String, name: String },
    DuplicateProposal { requirement_id: String, name: String },
    CrossRequirementDuplicate { requirement_id: String, name: String },
    MalformedResponse { detail: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RejectionReason::*;
        match self {
            LengthMismatch { expected, actual } => {
                write!(f, "expected {expected} payloads, got {actual}")
            }
            RequirementMismatch { expected, actual } => {
                write!(f, "payload for {expected} is labelled {actual}")
            }
            MissingField { requirement_id, field } => {
                write!(f, "{requirement_id}: missing field {field}")
            }
            MalformedField { requirement_id, field, detail } => {
                write!(f, "{requirement_id}: malformed {field}: {detail}")
            }
            UnknownExistingFunction { requirement_id, name } => {
                write!(f, "{requirement_id}: {name} is not in the catalog")
            }
            InvalidCoverage { requirement_id, value } => {
                write!(f, "{requirement_id}: coverage {value} is not 1-10 or {MANUAL_ONLY}")
            }
            ManualOnlyNotAllowed { requirement_id } => write!(
                f,
                "{requirement_id}: {MANUAL_ONLY} needs a manual requirement with no functions"
            ),
            InvalidFunctionName { requirement_id, name } => {
                write!(f, "{requirement_id}: {name} does not follow service_resource_condition")
            }
            ProposalAlreadyExists { requirement_id, name } => {
                write!(f, "{requirement_id}: proposed {name} already exists")
            }
            DuplicateProposal { requirement_id, name } => {
                write!(f, "{requirement_id}: {name} proposed twice")
            }
            CrossRequirementDuplicate { requirement_id, name } => write!(
                f,
                "{requirement_id}: {name} also proposed by another requirement in the batch"
            ),
            MalformedResponse { detail } => write!(f, "malformed response: {detail}"),
        }
    }
}

/// Parsed payload that passed every rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPayload {
    pub existing: Vec<String>,
    pub coverage: Coverage,
    pub proposals: Vec<NewFunctionProposal>,
    pub renames: Vec<RenameSuggestion>,
    pub consolidations: Vec<ConsolidationSuggestion>,
    pub notes: String,
}

impl ValidatedPayload {
    /// Names flagged as the target of a consolidation.
    fn consolidation_targets(&self) -> impl Iterator<Item = &str> {
        self.consolidations.iter().map(|c| c.new_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Accepted(ValidatedPayload),
    Rejected(Vec<RejectionReason>),
}

impl ValidationResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationResult::Accepted(_))
    }

    pub fn payload(&self) -> Option<&ValidatedPayload> {
        match self {
            ValidationResult::Accepted(p) => Some(p),
            ValidationResult::Rejected(_) => None,
        }
    }
}

/// Outcome for a whole batch. `outcomes` is empty when a batch-level rule
/// failed before any payload could be checked.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchValidation {
    pub outcomes: Vec<ValidationResult>,
    pub batch_reasons: Vec<RejectionReason>,
}

impl BatchValidation {
    pub fn rejected(reason: RejectionReason) -> Self {
        Self {
            outcomes: Vec::new(),
            batch_reasons: vec![reason],
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.batch_reasons.is_empty() && self.outcomes.iter().all(ValidationResult::is_accepted)
    }

    pub fn reasons(&self) -> Vec<RejectionReason> {
        let mut reasons = self.batch_reasons.clone();
        for outcome in &self.outcomes {
            if let ValidationResult::Rejected(r) = outcome {
                reasons.extend(r.iter().cloned());
            }
        }
        reasons
    }

    /// Lowest scored coverage among accepted payloads.
    pub fn min_coverage(&self) -> Option<u8> {
        self.outcomes
            .iter()
            .filter_map(|o| o.payload())
            .filter_map(|p| p.coverage.score())
            .min()
    }
}

// =============================================================================
// SINGLE PAYLOAD
// =============================================================================

/// Check one payload against its requirement and the catalog snapshot.
pub fn validate(requirement: &Requirement, raw: &Value, catalog: &Catalog) -> ValidationResult {
    let parsed = match parse_payload(requirement, raw) {
        Ok(p) => p,
        Err(reason) => return ValidationResult::Rejected(vec![reason]),
    };
    let id = &requirement.id;

    let unknown: Vec<RejectionReason> = parsed
        .existing
        .iter()
        .filter(|name| !catalog.exists(name))
        .map(|name| RejectionReason::UnknownExistingFunction {
            requirement_id: id.clone(),
            name: name.clone(),
        })
        .collect();
    if !unknown.is_empty() {
        return ValidationResult::Rejected(unknown);
    }

    let Some(coverage) = parse_coverage(&parsed.coverage_raw) else {
        return ValidationResult::Rejected(vec![RejectionReason::InvalidCoverage {
            requirement_id: id.clone(),
            value: parsed.coverage_raw.to_string(),
        }]);
    };
    let payload = parsed.into_payload(coverage);

    if payload.coverage == Coverage::ManualOnly
        && !(requirement.is_manual() && payload.existing.is_empty() && payload.proposals.is_empty())
    {
        return ValidationResult::Rejected(vec![RejectionReason::ManualOnlyNotAllowed {
            requirement_id: id.clone(),
        }]);
    }

    let mut reasons = Vec::new();
    let mut seen = HashSet::new();
    for proposal in &payload.proposals {
        let name = &proposal.name;
        if !is_canonical_name(name) {
            reasons.push(RejectionReason::InvalidFunctionName {
                requirement_id: id.clone(),
                name: name.clone(),
            });
        } else if catalog.exists(name) {
            reasons.push(RejectionReason::ProposalAlreadyExists {
                requirement_id: id.clone(),
                name: name.clone(),
            });
        } else if !seen.insert(name.as_str()) {
            reasons.push(RejectionReason::DuplicateProposal {
                requirement_id: id.clone(),
                name: name.clone(),
            });
        }
    }
    if !reasons.is_empty() {
        return ValidationResult::Rejected(reasons);
    }

    ValidationResult::Accepted(payload)
}

/// Check a full batch response. Payloads pair with requirements by position.
pub fn validate_batch(
    requirements: &[Requirement],
    response: &BatchResponse,
    catalog: &Catalog,
) -> BatchValidation {
    if response.payloads.len() != requirements.len() {
        return BatchValidation::rejected(RejectionReason::LengthMismatch {
            expected: requirements.len(),
            actual: response.payloads.len(),
        });
    }

    let mismatched: Vec<RejectionReason> = requirements
        .iter()
        .zip(&response.payloads)
        .filter_map(|(req, raw)| {
            let echoed = raw.get("requirement_id").and_then(Value::as_str)?;
            (echoed != req.id).then(|| RejectionReason::RequirementMismatch {
                expected: req.id.clone(),
                actual: echoed.to_string(),
            })
        })
        .collect();
    if !mismatched.is_empty() {
        return BatchValidation {
            outcomes: Vec::new(),
            batch_reasons: mismatched,
        };
    }

    let mut outcomes: Vec<ValidationResult> = requirements
        .iter()
        .zip(&response.payloads)
        .map(|(req, raw)| validate(req, raw, catalog))
        .collect();

    reject_cross_requirement_duplicates(requirements, &mut outcomes);

    BatchValidation {
        outcomes,
        batch_reasons: Vec::new(),
    }
}

/// A name proposed by two or more requirements is only allowed when one of
/// them flags it as a consolidation target.
fn reject_cross_requirement_duplicates(
    requirements: &[Requirement],
    outcomes: &mut [ValidationResult],
) {
    let mut proposers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut consolidated: HashSet<&str> = HashSet::new();
    for (idx, outcome) in outcomes.iter().enumerate() {
        if let Some(payload) = outcome.payload() {
            for proposal in &payload.proposals {
                proposers.entry(proposal.name.as_str()).or_default().push(idx);
            }
            consolidated.extend(payload.consolidation_targets());
        }
    }

    let mut offending: BTreeMap<usize, Vec<RejectionReason>> = BTreeMap::new();
    for (name, indices) in proposers {
        if indices.len() < 2 || consolidated.contains(name) {
            continue;
        }
        for idx in indices {
            offending
                .entry(idx)
                .or_default()
                .push(RejectionReason::CrossRequirementDuplicate {
                    requirement_id: requirements[idx].id.clone(),
                    name: name.to_string(),
                });
        }
    }

    for (idx, reasons) in offending {
        outcomes[idx] = ValidationResult::Rejected(reasons);
    }
}

// =============================================================================
// PARSING
// =============================================================================

fn field<'a>(obj: &'a serde_json::Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| obj.get(*n))
}

/// Payload whose fields are present and well typed; coverage still raw.
struct ParsedPayload {
    existing: Vec<String>,
    coverage_raw: Value,
    proposals: Vec<NewFunctionProposal>,
    renames: Vec<RenameSuggestion>,
    consolidations: Vec<ConsolidationSuggestion>,
    notes: String,
}

impl ParsedPayload {
    fn into_payload(self, coverage: Coverage) -> ValidatedPayload {
        ValidatedPayload {
            existing: self.existing,
            coverage,
            proposals: self.proposals,
            renames: self.renames,
            consolidations: self.consolidations,
            notes: self.notes,
        }
    }
}

/// Rule 1: every required field present and well typed.
fn parse_payload(requirement: &Requirement, raw: &Value) -> Result<ParsedPayload, RejectionReason> {
    let id = &requirement.id;
    let missing = |field: &str| RejectionReason::MissingField {
        requirement_id: id.clone(),
        field: field.to_string(),
    };
    let malformed = |field: &str, detail: String| RejectionReason::MalformedField {
        requirement_id: id.clone(),
        field: field.to_string(),
        detail,
    };

    let obj = raw
        .as_object()
        .ok_or_else(|| malformed("payload", format!("expected object, got {}", type_name(raw))))?;

    let existing_raw = field(obj, &["existing_functions", "existing_functions_mapped", "mapped_existing"])
        .ok_or_else(|| missing("existing_functions"))?;
    let coverage_raw = field(obj, &["coverage", "coverage_score", "coverage_assessment"])
        .ok_or_else(|| missing("coverage"))?;
    let proposals_raw = field(obj, &["new_functions", "new_functions_needed", "proposed_new"])
        .ok_or_else(|| missing("new_functions"))?;
    let notes_raw = field(obj, &["notes", "mapping_notes"]).ok_or_else(|| missing("notes"))?;

    let existing: Vec<String> =
        list_of(existing_raw).map_err(|e| malformed("existing_functions", e))?;
    let proposals: Vec<NewFunctionProposal> =
        list_of(proposals_raw).map_err(|e| malformed("new_functions", e))?;
    let renames: Vec<RenameSuggestion> =
        optional_list(field(obj, &["rename_suggestions", "functions_to_rename"]))
            .map_err(|e| malformed("rename_suggestions", e))?;
    let consolidations: Vec<ConsolidationSuggestion> = optional_list(field(
        obj,
        &["consolidation_suggestions", "functions_to_consolidate"],
    ))
    .map_err(|e| malformed("consolidation_suggestions", e))?;

    let notes = match notes_raw {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => return Err(malformed("notes", format!("expected string, got {}", type_name(other)))),
    };

    Ok(ParsedPayload {
        existing,
        coverage_raw: coverage_raw.clone(),
        proposals,
        renames,
        consolidations,
        notes,
    })
}

/// Integer 1-10, the manual marker, or the legacy three-way enum.
pub fn parse_coverage(raw: &Value) -> Option<Coverage> {
    match raw {
        Value::Number(n) => {
            let v = n.as_u64()?;
            (1..=10).contains(&v).then(|| Coverage::Score(v as u8))
        }
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            MANUAL_ONLY | "manual" => Some(Coverage::ManualOnly),
            "complete" => Some(Coverage::Score(10)),
            "partial" => Some(Coverage::Score(5)),
            "none" => Some(Coverage::Score(1)),
            other => other
                .parse::<u8>()
                .ok()
                .filter(|v| (1..=10).contains(v))
                .map(Coverage::Score),
        },
        _ => None,
    }
}

/// Null counts as an empty list.
fn list_of<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<Vec<T>, String> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => serde_json::from_value(raw.clone()).map_err(|e| e.to_string()),
        other => Err(format!("expected list, got {}", type_name(other))),
    }
}

fn optional_list<T: serde::de::DeserializeOwned>(raw: Option<&Value>) -> Result<Vec<T>, String> {
    raw.map_or(Ok(Vec::new()), list_of)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Structural parse of a payload that was validated on an earlier run.
/// Used for cache hits, which skip the semantic rules.
pub fn interpret_cached(requirement: &Requirement, raw: &Value) -> Option<ValidatedPayload> {
    let parsed = parse_payload(requirement, raw).ok()?;
    let coverage = parse_coverage(&parsed.coverage_raw)?;
    Some(parsed.into_payload(coverage))
}
