//! Per-kext diagnostic collections and the fail-fast/exhaustive check policy.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Fixed categories under which problems are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DiagnosticKey {
    // Validation failures
    InfoDictionaryMissing,
    MissingProperty,
    IllegalType,
    IllegalValue,
    PluginContainsPlugins,
    DependencyLoop,
    ExecutableMissing,
    ExecutableLacksKmodInfo,
    // Authentication failures
    FileAccess,
    OwnerPermissions,
    // Warnings
    NonUniqueIOResourcesMatch,
    KernelAndKpiDependencies,
    NoExplicitKernelDependency,
    KmodInfoMismatch,
    CacheInconsistency,
}

impl DiagnosticKey {
    pub fn description(&self) -> &'static str {
        match self {
            DiagnosticKey::InfoDictionaryMissing => "Info dictionary missing or not a dictionary",
            DiagnosticKey::MissingProperty => "Missing property",
            DiagnosticKey::IllegalType => "Property has illegal type",
            DiagnosticKey::IllegalValue => "Property has illegal value",
            DiagnosticKey::PluginContainsPlugins => "Plugin contains plugins of its own",
            DiagnosticKey::DependencyLoop => "Possible dependency loop",
            DiagnosticKey::ExecutableMissing => "Declared executable does not exist",
            DiagnosticKey::ExecutableLacksKmodInfo => "Executable does not contain kmod_info",
            DiagnosticKey::FileAccess => "File not found or not accessible",
            DiagnosticKey::OwnerPermissions => "File owner/permissions are incorrect",
            DiagnosticKey::NonUniqueIOResourcesMatch => {
                "Personality matches on IOResources without IOMatchCategory"
            }
            DiagnosticKey::KernelAndKpiDependencies => {
                "Declares dependencies on both kernel components and KPIs"
            }
            DiagnosticKey::NoExplicitKernelDependency => {
                "No explicit kernel dependency; implicit dependency added"
            }
            DiagnosticKey::KmodInfoMismatch => "Executable kmod name/version differ from Info.plist",
            DiagnosticKey::CacheInconsistency => "Cached information differs from bundle on disk",
        }
    }
}

impl fmt::Display for DiagnosticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A recorded problem: either a bare flag or the offending property paths or
/// file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DiagnosticValue {
    Flag,
    Items(Vec<String>),
}

/// Mapping from category to recorded problem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    entries: BTreeMap<DiagnosticKey, DiagnosticValue>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a problem. Items are appended without duplicates; a flag never
    /// replaces an item list.
    pub fn record(&mut self, key: DiagnosticKey, item: Option<&str>) {
        match item {
            None => {
                self.entries.entry(key).or_insert(DiagnosticValue::Flag);
            }
            Some(item) => {
                let entry = self
                    .entries
                    .entry(key)
                    .or_insert_with(|| DiagnosticValue::Items(Vec::new()));
                match entry {
                    DiagnosticValue::Items(items) => {
                        if !items.iter().any(|existing| existing == item) {
                            items.push(item.to_string());
                        }
                    }
                    DiagnosticValue::Flag => {
                        *entry = DiagnosticValue::Items(vec![item.to_string()]);
                    }
                }
            }
        }
    }

    pub fn contains(&self, key: DiagnosticKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn get(&self, key: DiagnosticKey) -> Option<&DiagnosticValue> {
        self.entries.get(&key)
    }

    /// Items recorded under `key`; empty for flags and absent keys.
    pub fn items(&self, key: DiagnosticKey) -> &[String] {
        match self.entries.get(&key) {
            Some(DiagnosticValue::Items(items)) => items,
            _ => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn remove(&mut self, key: DiagnosticKey) {
        self.entries.remove(&key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DiagnosticKey, &DiagnosticValue)> {
        self.entries.iter()
    }
}

/// Why a declared dependency could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MissingDependency {
    /// No kext with the identifier is known at all.
    NoVersionAvailable,
    /// Kexts with the identifier exist but none declares a compatible version.
    NoCompatibleVersionDeclared,
    /// Compatible ranges are declared but none covers the requested version.
    NoCompatibleVersionInRange,
    /// A matching kext was found but its own dependencies failed.
    IndirectDependencyUnresolvable,
}

impl fmt::Display for MissingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MissingDependency::NoVersionAvailable => "No valid version of this dependency can be found",
            MissingDependency::NoCompatibleVersionDeclared => {
                "A valid version exists but declares no compatible version"
            }
            MissingDependency::NoCompatibleVersionInRange => {
                "A valid version exists but is not compatible with the requested version"
            }
            MissingDependency::IndirectDependencyUnresolvable => {
                "This dependency has dependencies that can't be resolved"
            }
        };
        f.write_str(text)
    }
}

/// Whether the first problem ends an operation or every check still runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPolicy {
    FailFast,
    Exhaustive,
}

impl CheckPolicy {
    pub fn from_full_tests(performs_full_tests: bool) -> Self {
        if performs_full_tests {
            CheckPolicy::Exhaustive
        } else {
            CheckPolicy::FailFast
        }
    }

    pub fn is_exhaustive(&self) -> bool {
        matches!(self, CheckPolicy::Exhaustive)
    }
}

/// Returned by [`Checker::fail`] when the policy says to stop checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Halt;

/// Records failures into a diagnostics collection under a check policy.
pub(crate) struct Checker<'d> {
    diagnostics: &'d mut Diagnostics,
    warnings: Option<&'d mut Diagnostics>,
    policy: CheckPolicy,
    failures: usize,
}

impl<'d> Checker<'d> {
    pub(crate) fn new(diagnostics: &'d mut Diagnostics, policy: CheckPolicy) -> Self {
        Checker {
            diagnostics,
            warnings: None,
            policy,
            failures: 0,
        }
    }

    pub(crate) fn with_warnings(
        diagnostics: &'d mut Diagnostics,
        warnings: &'d mut Diagnostics,
        policy: CheckPolicy,
    ) -> Self {
        Checker {
            diagnostics,
            warnings: Some(warnings),
            policy,
            failures: 0,
        }
    }

    /// Record a failure; `Err(Halt)` means stop under fail-fast.
    pub(crate) fn fail(&mut self, key: DiagnosticKey, item: Option<&str>) -> Result<(), Halt> {
        self.diagnostics.record(key, item);
        self.failures += 1;
        match self.policy {
            CheckPolicy::FailFast => Err(Halt),
            CheckPolicy::Exhaustive => Ok(()),
        }
    }

    /// Warnings never halt.
    pub(crate) fn warn(&mut self, key: DiagnosticKey, item: Option<&str>) {
        if let Some(warnings) = self.warnings.as_deref_mut() {
            warnings.record(key, item);
        }
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures
    }
}
