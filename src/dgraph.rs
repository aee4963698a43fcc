//! Dependency graph handed to the kernel link for a load.
//!
//! Entries are ordered dependencies first and the root last, each kext
//! appearing once. Kernel resources appear as kernel components named by
//! identifier; everything else is named by its executable path.

use crate::arena::{Arena, KextId};
use crate::error::{KextError, Result};
use crate::kext::Kext;
use std::collections::{HashMap, HashSet};

/// One module in a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphEntry {
    pub kext: KextId,
    /// Bundle identifier for kernel components, executable path otherwise.
    pub name: String,
    pub is_kernel_component: bool,
    pub expected_kmod_name: String,
    pub expected_kmod_version: String,
    /// Indices of direct dependencies within the graph.
    pub dependencies: Vec<usize>,
    /// Set for modules already loaded, and by the kernel link after a load.
    pub load_address: Option<u64>,
}

/// Topologically ordered expansion of a kext's dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    entries: Vec<GraphEntry>,
}

impl DependencyGraph {
    /// Build the graph for `root`, whose dependencies must already be
    /// resolved.
    pub fn build(kexts: &Arena<KextId, Kext>, root: KextId) -> Result<DependencyGraph> {
        let mut builder = Builder {
            kexts,
            entries: Vec::new(),
            index: HashMap::new(),
            visiting: HashSet::new(),
        };
        builder.visit(root)?;
        Ok(DependencyGraph {
            entries: builder.entries,
        })
    }

    pub fn entries(&self) -> &[GraphEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [GraphEntry] {
        &mut self.entries
    }

    pub fn root(&self) -> Option<&GraphEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, kext: KextId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.kext == kext)
    }
}

struct Builder<'a> {
    kexts: &'a Arena<KextId, Kext>,
    entries: Vec<GraphEntry>,
    index: HashMap<KextId, usize>,
    visiting: HashSet<KextId>,
}

impl Builder<'_> {
    fn visit(&mut self, id: KextId) -> Result<usize> {
        if let Some(index) = self.index.get(&id) {
            return Ok(*index);
        }
        let kexts = self.kexts;
        let kext = kexts.get(id).ok_or(KextError::StaleHandle)?;
        if !self.visiting.insert(id) {
            return Err(KextError::DependencyLoop(kext.display_name()));
        }
        if !kext.has_all_dependencies() {
            return Err(KextError::DependenciesUnresolvable(kext.display_name()));
        }

        let mut dependencies = Vec::with_capacity(kext.direct_dependencies().len());
        for dependency in kext.direct_dependencies() {
            dependencies.push(self.visit(*dependency)?);
        }
        self.visiting.remove(&id);

        let is_kernel_component = kext.is_kernel_resource();
        let name = if is_kernel_component {
            kext.display_name()
        } else {
            kext.executable_path()
                .unwrap_or_else(|| kext.bundle_path().to_path_buf())
                .display()
                .to_string()
        };
        let index = self.entries.len();
        self.entries.push(GraphEntry {
            kext: id,
            name,
            is_kernel_component,
            expected_kmod_name: kext.bundle_identifier().unwrap_or_default().to_string(),
            expected_kmod_version: kext.version_string(),
            dependencies,
            load_address: kext.load_address(),
        });
        self.index.insert(id, index);
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::RepositoryId;
    use crate::kext::keys;
    use crate::models::KernelResourceKind;
    use crate::plist::Dictionary;
    use crate::version::Version;
    use std::path::Path;

    fn add(kexts: &mut Arena<KextId, Kext>, repo: RepositoryId, identifier: &str, deps: &[KextId]) -> KextId {
        let mut info = Dictionary::new();
        info.insert(keys::EXECUTABLE.into(), identifier.rsplit('.').next().unwrap_or("x").into());
        let mut kext = Kext::from_info_dictionary(repo, Path::new("/repo"), format!("{}.kext", identifier), info);
        kext.bundle_identifier = Some(identifier.to_string());
        kext.version = Version::parse("1.0").ok();
        kext.direct_dependencies = deps.to_vec();
        kext.flags.has_all_dependencies = true;
        kexts.insert(kext)
    }

    fn repo() -> RepositoryId {
        let mut repositories: Arena<RepositoryId, ()> = Arena::new();
        repositories.insert(())
    }

    #[test]
    fn test_diamond_is_deduplicated_in_post_order() {
        let repo = repo();
        let mut kexts = Arena::new();
        let kernel = add(&mut kexts, repo, "com.apple.kernel.libkern", &[]);
        kexts.get_mut(kernel).unwrap().kernel_resource = KernelResourceKind::Pseudo;
        let left = add(&mut kexts, repo, "com.example.left", &[kernel]);
        let right = add(&mut kexts, repo, "com.example.right", &[kernel]);
        let root = add(&mut kexts, repo, "com.example.root", &[left, right]);

        let graph = DependencyGraph::build(&kexts, root).unwrap();
        let order: Vec<KextId> = graph.entries().iter().map(|e| e.kext).collect();
        assert_eq!(order, vec![kernel, left, right, root]);
        assert_eq!(graph.root().unwrap().dependencies, vec![1, 2]);
        assert!(graph.entries()[0].is_kernel_component);
        assert_eq!(graph.entries()[0].name, "com.apple.kernel.libkern");
        assert_eq!(graph.entries()[1].name, "/repo/com.example.left.kext/Contents/MacOS/left");
        assert_eq!(graph.entries()[3].expected_kmod_version, "1.0");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let repo = repo();
        let mut kexts = Arena::new();
        let a = add(&mut kexts, repo, "com.example.a", &[]);
        let b = add(&mut kexts, repo, "com.example.b", &[a]);
        kexts.get_mut(a).unwrap().direct_dependencies = vec![b];
        assert!(matches!(DependencyGraph::build(&kexts, a), Err(KextError::DependencyLoop(_))));
    }

    #[test]
    fn test_unresolved_root_is_rejected() {
        let repo = repo();
        let mut kexts = Arena::new();
        let a = add(&mut kexts, repo, "com.example.a", &[]);
        kexts.get_mut(a).unwrap().flags.has_all_dependencies = false;
        assert!(matches!(
            DependencyGraph::build(&kexts, a),
            Err(KextError::DependenciesUnresolvable(_))
        ));
    }
}
