//! Folds batch outcomes into per-requirement results and the shared catalog.

use tracing::{info, warn};

use crate::catalog::{Catalog, CatalogError, SharedCatalog};
use crate::dispatcher::{BatchOutcome, RequirementOutcome};
use crate::escalation::EscalationState;
use crate::types::{Coverage, CoverageBuckets, MappingResult, Requirement, RunSummary};
use crate::validator::{is_canonical_name, ValidatedPayload};

#[derive(Debug, Default)]
struct FoldStats {
    accepted: usize,
    renames: usize,
    conflicts: usize,
}

/// Build one result per requirement, in input order, and apply accepted
/// proposals, renames and consolidations to `catalog`.
///
/// Batches are folded in index order with one catalog write per batch. A
/// requirement without an outcome becomes a manual-review result.
pub fn aggregate(
    catalog: &SharedCatalog,
    requirements: &[Requirement],
    mut outcomes: Vec<BatchOutcome>,
) -> (Vec<MappingResult>, RunSummary) {
    outcomes.sort_by_key(|o| o.batch_index);

    let mut slots: Vec<Option<MappingResult>> = vec![None; requirements.len()];
    let mut stats = FoldStats::default();
    let mut summary = RunSummary {
        total_requirements: requirements.len(),
        batches: outcomes.len(),
        ..RunSummary::default()
    };

    for batch in outcomes {
        summary.cache_hits += usize::from(batch.cached);
        summary.inference_calls += batch.inference_calls;
        summary.escalations += batch.escalations;
        summary.cancelled |= matches!(batch.state, EscalationState::Cancelled { .. });

        let start = batch.range.start;
        catalog.update(|cat| {
            for (offset, outcome) in batch.outcomes.into_iter().enumerate() {
                let idx = start + offset;
                let Some(requirement) = requirements.get(idx) else {
                    warn!(batch_index = batch.batch_index, idx, "outcome outside requirement list");
                    continue;
                };
                let result = match outcome {
                    RequirementOutcome::Mapped(payload) => {
                        fold_payload(cat, requirement, payload, &mut stats)
                    }
                    RequirementOutcome::ManualReview(notes) => {
                        MappingResult::manual_review(&requirement.id, notes)
                    }
                };
                slots[idx] = Some(result);
            }
        });
    }

    let results: Vec<MappingResult> = slots
        .into_iter()
        .zip(requirements)
        .map(|(slot, req)| {
            slot.unwrap_or_else(|| {
                warn!(requirement_id = %req.id, "requirement missing from batch outcomes");
                MappingResult::manual_review(&req.id, "requirement was not dispatched")
            })
        })
        .collect();

    let mut coverage = CoverageBuckets::default();
    for result in &results {
        coverage.add(result.coverage_score);
    }
    summary.manual_only = coverage.manual_only;
    summary.coverage = coverage;
    summary.needs_review = results.iter().filter(|r| r.needs_review).count();
    summary.new_functions_accepted = stats.accepted;
    summary.renames_applied = stats.renames;
    summary.catalog_conflicts = stats.conflicts;
    summary.cache_hit_ratio = if summary.batches == 0 {
        0.0
    } else {
        summary.cache_hits as f64 / summary.batches as f64
    };

    (results, summary)
}

fn fold_payload(
    cat: &mut Catalog,
    requirement: &Requirement,
    payload: ValidatedPayload,
    stats: &mut FoldStats,
) -> MappingResult {
    let mut mapped_existing: Vec<String> = Vec::new();

    for name in &payload.existing {
        let canonical = cat.resolve(name).unwrap_or(name.as_str()).to_string();
        push_unique(&mut mapped_existing, canonical);
    }

    let mut proposed_new = Vec::new();
    for proposal in payload.proposals {
        if !is_canonical_name(&proposal.name) {
            warn!(
                requirement_id = %requirement.id,
                name = %proposal.name,
                "skipping proposal with non-canonical name"
            );
            continue;
        }
        let before = cat.version();
        match cat.accept(&proposal) {
            Ok(_) => {
                if cat.version() != before {
                    stats.accepted += 1;
                }
                proposed_new.push(proposal);
            }
            Err(CatalogError::DuplicateName(name)) => {
                let canonical = cat.resolve(&name).unwrap_or(name.as_str()).to_string();
                info!(
                    requirement_id = %requirement.id,
                    name = %name,
                    canonical = %canonical,
                    "proposal already in catalog; mapping to existing"
                );
                stats.conflicts += 1;
                push_unique(&mut mapped_existing, canonical);
            }
            Err(err) => {
                warn!(requirement_id = %requirement.id, error = %err, "proposal not accepted");
            }
        }
    }

    let renames = payload
        .renames
        .iter()
        .map(|r| (r.old_name.as_str(), r.new_name.as_str()));
    let consolidations = payload.consolidations.iter().flat_map(|c| {
        c.old_names
            .iter()
            .map(move |old| (old.as_str(), c.new_name.as_str()))
    });
    for (old, new) in renames.chain(consolidations) {
        if !is_canonical_name(new) {
            warn!(requirement_id = %requirement.id, old, new, "skipping rename to non-canonical name");
            continue;
        }
        let before = cat.version();
        match cat.apply_rename(old, new) {
            Ok(()) if cat.version() != before => stats.renames += 1,
            Ok(()) => {}
            Err(err) => {
                warn!(requirement_id = %requirement.id, old, new, error = %err, "rename not applied");
            }
        }
    }

    MappingResult {
        requirement_id: requirement.id.clone(),
        mapped_existing,
        proposed_new,
        rename_suggestions: payload.renames,
        consolidation_suggestions: payload.consolidations,
        coverage_score: payload.coverage,
        notes: payload.notes,
        needs_review: false,
    }
}

fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

/// True when `after` still resolves every name `before` did.
pub fn is_superset(before: &Catalog, after: &Catalog) -> bool {
    before.resolvable_names().all(|name| after.exists(name))
}

/// Whether a result ended with a usable automated mapping.
pub fn is_automated(result: &MappingResult) -> bool {
    !result.needs_review && !matches!(result.coverage_score, Coverage::ManualOnly)
}
