//! Catalog of check functions.
//!
//! The catalog only grows: accepting a proposal adds a name, and a rename
//! keeps the retired name resolvable as an alias of its successor. Readers
//! work from immutable snapshots; the single writer swaps in a new version.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::types::{CatalogEntry, NewFunctionProposal};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The name already resolves to a different entry.
    #[error("catalog already contains {0}")]
    DuplicateName(String),
    /// Neither side of a rename exists.
    #[error("neither {old} nor {new} exists in the catalog")]
    UnknownEntry { old: String, new: String },
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
    /// Retired name -> canonical name.
    aliases: BTreeMap<String, String>,
    /// Proposals accepted through `accept`, for idempotent re-acceptance.
    accepted: HashMap<String, NewFunctionProposal>,
    version: u64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from seed entries. Any name (canonical or alias) seen
    /// twice is rejected.
    pub fn from_entries<I>(entries: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = CatalogEntry>,
    {
        let mut catalog = Self::new();
        for entry in entries {
            if catalog.exists(&entry.canonical_name) {
                return Err(CatalogError::DuplicateName(entry.canonical_name));
            }
            for alias in &entry.aliases {
                if alias == &entry.canonical_name || catalog.exists(alias) {
                    return Err(CatalogError::DuplicateName(alias.clone()));
                }
                catalog
                    .aliases
                    .insert(alias.clone(), entry.canonical_name.clone());
            }
            catalog.entries.insert(entry.canonical_name.clone(), entry);
        }
        Ok(catalog)
    }

    /// Convenience seed from bare names with no metadata.
    pub fn from_names<I, S>(names: I) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_entries(
            names
                .into_iter()
                .map(|name| CatalogEntry::new(name, String::new())),
        )
    }

    /// True if `name` is a canonical name or an alias.
    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name) || self.aliases.contains_key(name)
    }

    /// Canonical name that `name` resolves to.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        if let Some((key, _)) = self.entries.get_key_value(name) {
            return Some(key.as_str());
        }
        self.aliases.get(name).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.resolve(name).and_then(|c| self.entries.get(c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Incremented by every successful mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Canonical names in sorted order.
    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Every name that resolves: canonical names and aliases.
    pub fn resolvable_names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .keys()
            .chain(self.aliases.keys())
            .map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    /// Add a proposed function. Re-accepting the identical proposal is a no-op
    /// that returns the same name.
    pub fn accept(&mut self, proposal: &NewFunctionProposal) -> Result<String, CatalogError> {
        if self.exists(&proposal.name) {
            return match self.accepted.get(&proposal.name) {
                Some(previous) if previous == proposal => Ok(proposal.name.clone()),
                _ => Err(CatalogError::DuplicateName(proposal.name.clone())),
            };
        }

        self.entries
            .insert(proposal.name.clone(), proposal.to_entry());
        self.accepted
            .insert(proposal.name.clone(), proposal.clone());
        self.version += 1;
        Ok(proposal.name.clone())
    }

    /// Retire `old` in favour of `new`. Afterwards both names resolve to the
    /// same entry, whose canonical name is `new` unless `new` was itself an
    /// alias.
    pub fn apply_rename(&mut self, old: &str, new: &str) -> Result<(), CatalogError> {
        let old_canonical = self.resolve(old).map(str::to_string);
        let new_canonical = self.resolve(new).map(str::to_string);

        match (old_canonical, new_canonical) {
            (None, None) => Err(CatalogError::UnknownEntry {
                old: old.to_string(),
                new: new.to_string(),
            }),
            (Some(a), Some(b)) if a == b => Ok(()),
            (None, Some(target)) => {
                self.add_alias(old, &target);
                self.version += 1;
                Ok(())
            }
            (Some(source), Some(target)) => {
                self.merge_into(&source, &target);
                self.version += 1;
                Ok(())
            }
            (Some(source), None) => {
                self.move_entry(&source, new);
                self.version += 1;
                Ok(())
            }
        }
    }

    fn add_alias(&mut self, alias: &str, canonical: &str) {
        self.aliases
            .insert(alias.to_string(), canonical.to_string());
        if let Some(entry) = self.entries.get_mut(canonical) {
            entry.aliases.insert(alias.to_string());
        }
    }

    /// Fold `source` and its aliases into the existing entry `target`.
    fn merge_into(&mut self, source: &str, target: &str) {
        let Some(retired) = self.entries.remove(source) else {
            return;
        };
        self.add_alias(&retired.canonical_name, target);
        for alias in retired.aliases {
            self.add_alias(&alias, target);
        }
    }

    /// Re-key `source` under the new canonical name `new`.
    fn move_entry(&mut self, source: &str, new: &str) {
        let Some(mut entry) = self.entries.remove(source) else {
            return;
        };
        entry.aliases.insert(entry.canonical_name.clone());
        entry.canonical_name = new.to_string();
        for alias in &entry.aliases {
            self.aliases.insert(alias.clone(), new.to_string());
        }
        if let Some(proposal) = self.accepted.remove(source) {
            self.accepted.insert(
                new.to_string(),
                NewFunctionProposal {
                    name: new.to_string(),
                    ..proposal
                },
            );
        }
        self.entries.insert(new.to_string(), entry);
    }
}

/// Shared handle: cheap snapshots for readers, serialized writes.
#[derive(Debug, Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Arc<Catalog>>>,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// Immutable view of the current version.
    pub fn snapshot(&self) -> Arc<Catalog> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Run `f` against a private copy and publish it. Snapshots taken before
    /// the call are unaffected.
    pub fn update<R>(&self, f: impl FnOnce(&mut Catalog) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> Catalog {
        Catalog::from_names([
            "iam_root_access_keys_absent",
            "s3_bucket_public_access_blocked",
        ])
        .unwrap()
    }

    #[test]
    fn seed_rejects_duplicates() {
        let err = Catalog::from_names(["a_b_c", "a_b_c"]).unwrap_err();
        assert_eq!(err, CatalogError::DuplicateName("a_b_c".into()));
    }

    #[test]
    fn accept_adds_and_is_idempotent() {
        let mut catalog = seed();
        let proposal = NewFunctionProposal::new("ec2_ebs_default_encryption_enabled", "ec2");

        assert_eq!(
            catalog.accept(&proposal).unwrap(),
            "ec2_ebs_default_encryption_enabled"
        );
        let version = catalog.version();
        assert_eq!(
            catalog.accept(&proposal).unwrap(),
            "ec2_ebs_default_encryption_enabled"
        );
        assert_eq!(catalog.version(), version);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn accept_rejects_existing_names() {
        let mut catalog = seed();
        let err = catalog
            .accept(&NewFunctionProposal::new("iam_root_access_keys_absent", "iam"))
            .unwrap_err();
        assert_eq!(
            err,
            CatalogError::DuplicateName("iam_root_access_keys_absent".into())
        );

        let mut different = NewFunctionProposal::new("kms_key_rotation_enabled", "kms");
        catalog.accept(&different).unwrap();
        different.rationale = "changed".into();
        assert!(catalog.accept(&different).is_err());
    }

    #[test]
    fn rename_to_new_name_keeps_old_as_alias() {
        let mut catalog = seed();
        catalog
            .apply_rename("iam_root_access_keys_absent", "iam_root_account_access_keys_absent")
            .unwrap();

        assert_eq!(
            catalog.resolve("iam_root_access_keys_absent"),
            Some("iam_root_account_access_keys_absent")
        );
        assert!(catalog.exists("iam_root_account_access_keys_absent"));
        assert_eq!(catalog.len(), 2);
        let entry = catalog.get("iam_root_access_keys_absent").unwrap();
        assert!(entry.aliases.contains("iam_root_access_keys_absent"));
    }

    #[test]
    fn rename_onto_existing_entry_merges() {
        let mut catalog = seed();
        catalog
            .apply_rename("s3_bucket_public_access_blocked", "iam_root_access_keys_absent")
            .unwrap();

        assert_eq!(catalog.len(), 1);
        assert_eq!(
            catalog.resolve("s3_bucket_public_access_blocked"),
            Some("iam_root_access_keys_absent")
        );
    }

    #[test]
    fn rename_from_unknown_old_name_registers_alias() {
        let mut catalog = seed();
        catalog
            .apply_rename("legacy_root_keys_check", "iam_root_access_keys_absent")
            .unwrap();
        assert_eq!(
            catalog.resolve("legacy_root_keys_check"),
            Some("iam_root_access_keys_absent")
        );
    }

    #[test]
    fn rename_between_unknown_names_fails() {
        let mut catalog = seed();
        let err = catalog.apply_rename("nope_nope_nope", "also_not_here").unwrap_err();
        assert!(matches!(err, CatalogError::UnknownEntry { .. }));
    }

    #[test]
    fn resolvable_names_never_shrink() {
        let mut catalog = seed();
        let before: Vec<String> = catalog.resolvable_names().map(str::to_string).collect();

        catalog.apply_rename("iam_root_access_keys_absent", "iam_root_keys_absent_v2").unwrap();
        catalog.apply_rename("iam_root_keys_absent_v2", "s3_bucket_public_access_blocked").unwrap();

        for name in &before {
            assert!(catalog.exists(name), "{name} no longer resolves");
        }
        assert!(catalog.exists("iam_root_keys_absent_v2"));
    }

    #[test]
    fn snapshots_are_isolated_from_updates() {
        let shared = SharedCatalog::new(seed());
        let before = shared.snapshot();

        shared.update(|c| {
            c.accept(&NewFunctionProposal::new("cloudtrail_log_validation_enabled", "cloudtrail"))
        })
        .unwrap();

        assert!(!before.exists("cloudtrail_log_validation_enabled"));
        assert!(shared.snapshot().exists("cloudtrail_log_validation_enabled"));
        assert!(shared.snapshot().version() > before.version());
    }
}
