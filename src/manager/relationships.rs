//! Version relationships: the per-identifier version chains and the state
//! machine deciding when they are cleared and rebuilt.
//!
//! A chain starts at the newest version of an identifier and follows
//! `prior_version` links through strictly older versions. Kexts sharing a
//! version hang off the first of them through `next_duplicate`.
//!
//! Any change to the set of kexts clears every chain and every resolved
//! dependency. Clears requested while suppressed are coalesced and run once
//! when the outermost suppression ends. Chains are rebuilt lazily.

use super::KextManager;
use crate::arena::{Arena, KextId};
use crate::error::{KextError, Result};
use crate::kext::Kext;
use crate::version::Version;
use log::{debug, warn};

/// Whether chains are current, and whether clears are being deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipState {
    /// Chains reflect the current kexts.
    Clean,
    /// Chains were cleared and must be rebuilt before use.
    Dirty,
    /// Clears are deferred. `stale` means chains must be rebuilt before use.
    Suppressed {
        depth: u32,
        pending_clear: bool,
        stale: bool,
    },
}

impl Default for RelationshipState {
    fn default() -> Self {
        RelationshipState::Dirty
    }
}

impl RelationshipState {
    /// Request a clear. Returns true if the caller must clear now.
    pub fn request_clear(&mut self) -> bool {
        match self {
            RelationshipState::Clean | RelationshipState::Dirty => {
                *self = RelationshipState::Dirty;
                true
            }
            RelationshipState::Suppressed { pending_clear, .. } => {
                *pending_clear = true;
                false
            }
        }
    }

    /// Enter a suppression region. Regions nest.
    pub fn disable(&mut self) {
        *self = match *self {
            RelationshipState::Clean => RelationshipState::Suppressed {
                depth: 1,
                pending_clear: false,
                stale: false,
            },
            RelationshipState::Dirty => RelationshipState::Suppressed {
                depth: 1,
                pending_clear: false,
                stale: true,
            },
            RelationshipState::Suppressed {
                depth,
                pending_clear,
                stale,
            } => RelationshipState::Suppressed {
                depth: depth + 1,
                pending_clear,
                stale,
            },
        };
    }

    /// Leave a suppression region. Returns true if a deferred clear must run
    /// now.
    pub fn enable(&mut self) -> bool {
        match *self {
            RelationshipState::Suppressed {
                depth,
                pending_clear,
                stale,
            } if depth > 1 => {
                *self = RelationshipState::Suppressed {
                    depth: depth - 1,
                    pending_clear,
                    stale,
                };
                false
            }
            RelationshipState::Suppressed {
                pending_clear,
                stale,
                ..
            } => {
                *self = if pending_clear || stale {
                    RelationshipState::Dirty
                } else {
                    RelationshipState::Clean
                };
                pending_clear
            }
            RelationshipState::Clean | RelationshipState::Dirty => {
                warn!("[KextManager] Unbalanced enable of relationship clearing");
                false
            }
        }
    }

    /// Chains were rebuilt.
    pub fn mark_calculated(&mut self) {
        match self {
            RelationshipState::Clean | RelationshipState::Dirty => *self = RelationshipState::Clean,
            RelationshipState::Suppressed { stale, .. } => *stale = false,
        }
    }

    pub fn needs_calculate(&self) -> bool {
        matches!(
            self,
            RelationshipState::Dirty | RelationshipState::Suppressed { stale: true, .. }
        )
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, RelationshipState::Suppressed { .. })
    }
}

fn version_of(kexts: &Arena<KextId, Kext>, id: KextId) -> Result<i64> {
    let kext = kexts.get(id).ok_or(KextError::StaleHandle)?;
    Ok(kext.version().map(|v| v.raw()).unwrap_or(Version::INVALID))
}

/// Append `new` to the duplicate list of `node`. Returns false if it was
/// already there.
pub(crate) fn add_duplicate_version(kexts: &mut Arena<KextId, Kext>, node: KextId, new: KextId) -> Result<bool> {
    let mut last = node;
    loop {
        if last == new {
            return Ok(false);
        }
        match kexts.get(last).ok_or(KextError::StaleHandle)?.next_duplicate {
            Some(next) => last = next,
            None => break,
        }
    }
    kexts.get_mut(last).ok_or(KextError::StaleHandle)?.next_duplicate = Some(new);
    Ok(true)
}

fn duplicates_contain(kexts: &Arena<KextId, Kext>, node: KextId, target: KextId) -> bool {
    let mut current = Some(node);
    while let Some(id) = current {
        if id == target {
            return true;
        }
        current = kexts.get(id).and_then(|kext| kext.next_duplicate);
    }
    false
}

/// Insert `new` into the chain headed by `head`, returning the chain's new
/// head.
///
/// `new` must not already have a prior version. Inserting a kext already in
/// the chain changes nothing.
pub(crate) fn add_prior_or_duplicate_version(
    kexts: &mut Arena<KextId, Kext>,
    head: KextId,
    new: KextId,
) -> Result<KextId> {
    if head == new {
        return Ok(head);
    }
    let new_kext = kexts.get(new).ok_or(KextError::StaleHandle)?;
    if new_kext.prior_version.is_some() {
        return Err(KextError::InvalidArgument(format!(
            "{} is already linked to a prior version",
            new_kext.display_name()
        )));
    }
    let new_version = version_of(kexts, new)?;

    if new_version > version_of(kexts, head)? {
        kexts.get_mut(new).ok_or(KextError::StaleHandle)?.prior_version = Some(head);
        return Ok(new);
    }

    let mut previous: Option<KextId> = None;
    let mut current = head;
    loop {
        if duplicates_contain(kexts, current, new) {
            return Ok(head);
        }
        let current_version = version_of(kexts, current)?;
        if current_version == new_version {
            add_duplicate_version(kexts, current, new)?;
            return Ok(head);
        }
        if current_version < new_version {
            kexts.get_mut(new).ok_or(KextError::StaleHandle)?.prior_version = Some(current);
            if let Some(previous) = previous {
                kexts.get_mut(previous).ok_or(KextError::StaleHandle)?.prior_version = Some(new);
            }
            return Ok(head);
        }
        match kexts.get(current).ok_or(KextError::StaleHandle)?.prior_version {
            Some(prior) => {
                previous = Some(current);
                current = prior;
            }
            None => {
                kexts.get_mut(current).ok_or(KextError::StaleHandle)?.prior_version = Some(new);
                return Ok(head);
            }
        }
    }
}

/// Every kext of a chain: each version's primary, then its duplicates,
/// newest version first.
pub(crate) fn chain_members(kexts: &Arena<KextId, Kext>, head: KextId) -> Vec<KextId> {
    let mut members = Vec::new();
    let mut version = Some(head);
    while let Some(primary) = version {
        if members.contains(&primary) {
            break;
        }
        let mut duplicate = Some(primary);
        while let Some(id) = duplicate {
            if members.contains(&id) {
                break;
            }
            members.push(id);
            duplicate = kexts.get(id).and_then(|kext| kext.next_duplicate);
        }
        version = kexts.get(primary).and_then(|kext| kext.prior_version);
    }
    members
}

impl KextManager {
    /// Clear all chains and resolved dependencies, or defer the clear while
    /// suppressed.
    pub fn clear_relationships(&mut self) {
        if self.relationships.request_clear() {
            self.perform_clear();
        }
    }

    /// Defer clears until the matching `enable_clear_relationships`.
    pub fn disable_clear_relationships(&mut self) {
        self.relationships.disable();
    }

    /// End a suppression region, running a deferred clear once if the
    /// region was the outermost.
    pub fn enable_clear_relationships(&mut self) {
        if self.relationships.enable() {
            self.perform_clear();
        }
    }

    pub fn relationship_state(&self) -> RelationshipState {
        self.relationships
    }

    fn perform_clear(&mut self) {
        debug!("[KextManager] Clearing version relationships");
        for (_, kext) in self.kexts.iter_mut() {
            kext.clear_relationships();
        }
        self.candidate_index.clear();
        self.kexts_with_missing_dependencies.clear();
    }

    /// Whether a kext may take part in version chains.
    fn is_chain_eligible(&self, kext: &Kext) -> bool {
        kext.is_valid()
            && !kext.load_failed()
            && kext.is_enabled()
            && kext.bundle_identifier().is_some()
            && (!self.config.safe_boot || kext.is_eligible_during_safe_boot())
    }

    /// Rebuild every version chain from the candidates of all repositories.
    pub fn calculate_version_relationships(&mut self) -> Result<()> {
        for (_, kext) in self.kexts.iter_mut() {
            kext.clear_relationships();
        }
        self.candidate_index.clear();
        self.kexts_with_missing_dependencies.clear();

        let mut eligible = Vec::new();
        for repository_id in &self.repository_order {
            let repository = match self.repositories.get(*repository_id) {
                Some(repository) => repository,
                None => continue,
            };
            for id in repository.candidate_kexts() {
                if let Some(kext) = self.kexts.get(*id) {
                    if self.is_chain_eligible(kext) {
                        eligible.push(*id);
                    }
                }
            }
        }

        for id in eligible {
            let identifier = match self.kexts.get(id).and_then(|kext| kext.bundle_identifier()) {
                Some(identifier) => identifier.to_string(),
                None => continue,
            };
            let head = match self.candidate_index.get(&identifier) {
                Some(head) => add_prior_or_duplicate_version(&mut self.kexts, *head, id)?,
                None => id,
            };
            self.candidate_index.insert(identifier, head);
        }

        self.relationships.mark_calculated();
        debug!(
            "[KextManager] Calculated version relationships for {} identifiers",
            self.candidate_index.len()
        );
        Ok(())
    }

    /// Rebuild chains if they were cleared.
    pub(crate) fn ensure_relationships(&mut self) -> Result<()> {
        if self.relationships.needs_calculate() {
            self.calculate_version_relationships()?;
        }
        Ok(())
    }

    /// Remove `failed` from their chains, keeping the order of the rest, and
    /// list them as having missing dependencies.
    pub(crate) fn excise_from_chains(&mut self, failed: &[KextId]) -> Result<()> {
        if failed.is_empty() {
            return Ok(());
        }
        let heads: Vec<(String, KextId)> = self
            .candidate_index
            .iter()
            .map(|(identifier, head)| (identifier.clone(), *head))
            .collect();

        for (identifier, head) in heads {
            let members = chain_members(&self.kexts, head);
            if !members.iter().any(|member| failed.contains(member)) {
                continue;
            }
            for member in &members {
                if let Some(kext) = self.kexts.get_mut(*member) {
                    kext.prior_version = None;
                    kext.next_duplicate = None;
                }
            }
            let mut survivors = members.into_iter().filter(|member| !failed.contains(member));
            let mut new_head = match survivors.next() {
                Some(first) => first,
                None => {
                    self.candidate_index.remove(&identifier);
                    continue;
                }
            };
            for survivor in survivors {
                new_head = add_prior_or_duplicate_version(&mut self.kexts, new_head, survivor)?;
            }
            self.candidate_index.insert(identifier, new_head);
        }

        for id in failed {
            if !self.kexts_with_missing_dependencies.contains(id) {
                self.kexts_with_missing_dependencies.push(*id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::RepositoryId;
    use crate::plist::Dictionary;
    use std::path::Path;

    fn kext(kexts: &mut Arena<KextId, Kext>, version: &str) -> KextId {
        let mut repositories: Arena<RepositoryId, ()> = Arena::new();
        let repo = repositories.insert(());
        let mut kext = Kext::from_info_dictionary(repo, Path::new("/r"), "A.kext", Dictionary::new());
        kext.bundle_identifier = Some("com.example.a".into());
        kext.version = Version::parse(version).ok();
        kexts.insert(kext)
    }

    fn chain_versions(kexts: &Arena<KextId, Kext>, head: KextId) -> Vec<String> {
        chain_members(kexts, head)
            .into_iter()
            .map(|id| kexts.get(id).unwrap().version_string())
            .collect()
    }

    #[test]
    fn test_state_machine_coalesces_clears() {
        let mut state = RelationshipState::Clean;
        state.disable();
        state.disable();
        assert!(!state.request_clear());
        assert!(!state.request_clear());
        assert!(!state.enable());
        assert!(state.enable());
        assert_eq!(state, RelationshipState::Dirty);
        assert!(state.needs_calculate());
        state.mark_calculated();
        assert_eq!(state, RelationshipState::Clean);
    }

    #[test]
    fn test_state_machine_without_pending_clear() {
        let mut state = RelationshipState::Clean;
        state.disable();
        assert!(!state.needs_calculate());
        assert!(!state.enable());
        assert_eq!(state, RelationshipState::Clean);

        let mut state = RelationshipState::Dirty;
        state.disable();
        assert!(state.needs_calculate());
        state.mark_calculated();
        assert!(!state.needs_calculate());
        assert!(!state.enable());
        assert_eq!(state, RelationshipState::Clean);
    }

    #[test]
    fn test_unbalanced_enable_is_harmless() {
        let mut state = RelationshipState::Clean;
        assert!(!state.enable());
        assert_eq!(state, RelationshipState::Clean);
    }

    #[test]
    fn test_insert_newer_becomes_head() {
        let mut kexts = Arena::new();
        let old = kext(&mut kexts, "1.0");
        let new = kext(&mut kexts, "2.0");
        let head = add_prior_or_duplicate_version(&mut kexts, old, new).unwrap();
        assert_eq!(head, new);
        assert_eq!(kexts.get(new).unwrap().prior_version(), Some(old));
    }

    #[test]
    fn test_insert_orders_and_splices() {
        let mut kexts = Arena::new();
        let v3 = kext(&mut kexts, "3.0");
        let v1 = kext(&mut kexts, "1.0");
        let v2 = kext(&mut kexts, "2.0");
        let v0 = kext(&mut kexts, "0.5");
        let mut head = v3;
        for id in [v1, v2, v0] {
            head = add_prior_or_duplicate_version(&mut kexts, head, id).unwrap();
        }
        assert_eq!(head, v3);
        assert_eq!(chain_versions(&kexts, head), vec!["3.0", "2.0", "1.0", "0.5"]);
    }

    #[test]
    fn test_equal_versions_form_duplicate_list() {
        let mut kexts = Arena::new();
        let first = kext(&mut kexts, "1.0");
        let second = kext(&mut kexts, "1.0");
        let third = kext(&mut kexts, "1.0");
        let mut head = first;
        for id in [second, third] {
            head = add_prior_or_duplicate_version(&mut kexts, head, id).unwrap();
        }
        assert_eq!(head, first);
        assert_eq!(kexts.get(first).unwrap().next_duplicate(), Some(second));
        assert_eq!(kexts.get(second).unwrap().next_duplicate(), Some(third));
        assert_eq!(kexts.get(first).unwrap().prior_version(), None);
    }

    #[test]
    fn test_reinsertion_is_idempotent() {
        let mut kexts = Arena::new();
        let v2 = kext(&mut kexts, "2.0");
        let v1 = kext(&mut kexts, "1.0");
        let dup = kext(&mut kexts, "2.0");
        let mut head = add_prior_or_duplicate_version(&mut kexts, v2, v1).unwrap();
        head = add_prior_or_duplicate_version(&mut kexts, head, dup).unwrap();
        let before = chain_members(&kexts, head);

        assert_eq!(add_prior_or_duplicate_version(&mut kexts, head, v2).unwrap(), head);
        assert_eq!(add_prior_or_duplicate_version(&mut kexts, head, dup).unwrap(), head);
        assert_eq!(chain_members(&kexts, head), before);
    }

    #[test]
    fn test_linked_source_is_rejected() {
        let mut kexts = Arena::new();
        let v2 = kext(&mut kexts, "2.0");
        let v1 = kext(&mut kexts, "1.0");
        let v3 = kext(&mut kexts, "3.0");
        kexts.get_mut(v3).unwrap().prior_version = Some(v1);
        assert!(matches!(
            add_prior_or_duplicate_version(&mut kexts, v2, v3),
            Err(KextError::InvalidArgument(_))
        ));
    }
}
