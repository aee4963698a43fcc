/// Load orchestration: from a kext handle to a dependency graph handed to
/// the kernel link.
///
/// This module handles:
/// - Refreshing the loaded state of every kext from the kernel snapshot
/// - Checking, resolving and authenticating a kext and its dependencies
/// - Asking the user for approval, overrides and load addresses
/// - Publishing driver personalities

use super::KextManager;
use crate::arena::KextId;
use crate::dgraph::DependencyGraph;
use crate::error::{KextError, Result};
use crate::kext::keys;
use crate::log_info;
use crate::manager::callbacks::LoadOutcome;
use crate::plist::{Dictionary, Value};
use log::{debug, warn};
use std::io;

/// Interactive behaviour of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Ask `approve` before handing the graph to the kernel link.
    pub ask_approval: bool,
    /// Ask `approve` whether to load despite authentication failures.
    pub allow_authentication_override: bool,
    /// Ask `input` for the load address of every module not yet loaded.
    pub prompt_for_load_addresses: bool,
}

/// Parse a load address typed by the user, with or without `0x`.
pub fn parse_load_address(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

impl KextManager {
    /// Mark kexts loaded, or another version of them loaded, from the kernel
    /// link's snapshot.
    pub fn check_for_loaded_kexts(&mut self) -> Result<()> {
        let snapshot = self.kernel.loaded_modules()?;
        for (_, kext) in self.kexts.iter_mut() {
            let entry = kext
                .bundle_identifier()
                .and_then(|identifier| snapshot.iter().find(|entry| entry.name == identifier));
            let (loaded, other, address) = match entry {
                None => (false, false, None),
                Some(entry) if kext.version().is_some() && entry.parsed_version() == kext.version() => {
                    (true, false, Some(entry.load_address))
                }
                Some(_) => (false, true, None),
            };
            kext.flags.is_loaded = loaded;
            kext.flags.other_version_is_loaded = other;
            kext.load_address = address;
        }
        debug!("[KextManager] {} modules loaded in kernel", snapshot.len());
        Ok(())
    }

    /// Load a kext and any dependencies not yet loaded.
    ///
    /// Returns the graph handed to the kernel link, with load addresses
    /// filled in.
    pub fn load_kext(&mut self, id: KextId, options: LoadOptions) -> Result<DependencyGraph> {
        match self.realize_kext(id) {
            Ok(()) => {}
            Err(KextError::CacheInconsistency(name)) => {
                warn!("[KextManager] Loading {} with cached information", name);
            }
            Err(e) => return Err(e),
        }

        self.check_loadable(id)?;
        self.ensure_relationships()?;
        self.check_for_loaded_kexts()?;
        {
            let kext = self.kexts.get(id).ok_or(KextError::StaleHandle)?;
            if kext.is_loaded() {
                return Err(KextError::AlreadyLoaded(kext.display_name()));
            }
            if kext.other_version_is_loaded() {
                return Err(KextError::LoadedVersionDiffers(kext.display_name()));
            }
        }

        for (_, kext) in self.kexts.iter_mut() {
            kext.clear_dependency_state();
        }
        self.resolve_dependencies(id)?;

        self.disable_clear_relationships();
        let authenticated = self.authenticate_for_load(id, options);
        self.enable_clear_relationships();
        authenticated?;

        let name = self.kexts.get(id).ok_or(KextError::StaleHandle)?.display_name();
        if options.ask_approval && !self.callbacks.approve(false, &format!("Load extension {}?", name)) {
            return Err(KextError::UserAbort(name));
        }

        let mut graph = DependencyGraph::build(&self.kexts, id)?;
        if options.prompt_for_load_addresses {
            self.prompt_for_addresses(&mut graph, &name)?;
        }

        let outcomes = self.kernel.load(&graph, self.config.performs_loads_in_task)?;
        self.apply_outcomes(&mut graph, &outcomes)?;

        self.callbacks.log(&format!("{} loaded successfully", name));
        log_info!("[KextManager] Loaded {} ({} modules in graph)", name, graph.len());
        Ok(graph)
    }

    fn check_loadable(&self, id: KextId) -> Result<()> {
        let kext = self.kexts.get(id).ok_or(KextError::StaleHandle)?;
        let name = kext.display_name();
        if kext.is_kernel_resource() {
            return Err(KextError::KernelResource(name));
        }
        if kext.declares_executable() {
            if let Some(executable) = kext.executable_path() {
                match self.inspector.supports_host_arch(&executable) {
                    Ok(true) => {}
                    Ok(false) => return Err(KextError::ArchNotFound(name)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(KextError::FileNotFound(executable));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if !kext.is_valid() {
            return Err(KextError::Validation(name));
        }
        if self.config.safe_boot && !kext.is_eligible_during_safe_boot() {
            return Err(KextError::NotEligibleDuringSafeBoot(name));
        }
        if !kext.is_enabled() {
            return Err(KextError::Disabled(name));
        }
        Ok(())
    }

    /// The kext and its transitive dependencies, root first.
    fn load_list(&self, id: KextId) -> Vec<KextId> {
        let mut list = vec![id];
        let mut index = 0;
        while index < list.len() {
            if let Some(kext) = self.kexts.get(list[index]) {
                for dependency in kext.direct_dependencies() {
                    if !list.contains(dependency) {
                        list.push(*dependency);
                    }
                }
            }
            index += 1;
        }
        list
    }

    /// Authenticate everything in the load list. Failures are disqualified
    /// unless the caller overrides them.
    fn authenticate_for_load(&mut self, id: KextId, options: LoadOptions) -> Result<()> {
        let mut failed = Vec::new();
        for kid in self.load_list(id) {
            let kext = self.kexts.get(kid).ok_or(KextError::StaleHandle)?;
            let authentic = if kext.has_been_authenticated() {
                kext.is_authentic()
            } else {
                self.authenticate_kext(kid)?
            };
            if !authentic {
                failed.push(kid);
            }
        }
        if failed.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = failed
            .iter()
            .filter_map(|kid| self.kexts.get(*kid))
            .map(|kext| kext.display_name())
            .collect();
        let prompt = format!(
            "Authentication failed for {}. Load anyway?",
            names.join(", ")
        );
        if options.allow_authentication_override && self.callbacks.approve(false, &prompt) {
            for kid in &failed {
                if let Some(kext) = self.kexts.get_mut(*kid) {
                    kext.mark_authentic();
                }
            }
            warn!("[KextManager] Authentication overridden for {}", names.join(", "));
            return Ok(());
        }

        for kid in &failed {
            self.disqualify_kext(*kid)?;
        }
        self.clear_relationships();
        Err(KextError::Authentication(names.join(", ")))
    }

    fn prompt_for_addresses(&self, graph: &mut DependencyGraph, name: &str) -> Result<()> {
        for entry in graph.entries_mut() {
            if entry.is_kernel_component || entry.load_address.is_some() {
                continue;
            }
            let prompt = format!("Enter the hexadecimal load address for {}:", entry.expected_kmod_name);
            let answer = self
                .callbacks
                .input(&prompt)
                .ok_or_else(|| KextError::UserAbort(name.to_string()))?;
            let address = parse_load_address(&answer).ok_or_else(|| {
                KextError::InvalidArgument(format!("Not a hexadecimal address: {:?}", answer))
            })?;
            entry.load_address = Some(address);
        }
        Ok(())
    }

    /// Record per-module outcomes. The first failure is returned after every
    /// outcome has been applied.
    fn apply_outcomes(&mut self, graph: &mut DependencyGraph, outcomes: &[LoadOutcome]) -> Result<()> {
        let mut first_failure: Option<KextError> = None;
        for (index, entry) in graph.entries_mut().iter_mut().enumerate() {
            let outcome = outcomes
                .get(index)
                .cloned()
                .unwrap_or_else(|| LoadOutcome::Failed("no outcome reported".to_string()));
            let kext = match self.kexts.get_mut(entry.kext) {
                Some(kext) => kext,
                None => continue,
            };
            match outcome {
                LoadOutcome::Loaded { load_address } => {
                    kext.flags.is_loaded = true;
                    kext.load_address = Some(load_address);
                    entry.load_address = Some(load_address);
                }
                LoadOutcome::Failed(reason) => {
                    if entry.is_kernel_component {
                        continue;
                    }
                    kext.flags.load_failed = true;
                    let name = kext.display_name();
                    self.callbacks.log(&format!("{} failed to load: {}", name, reason));
                    first_failure.get_or_insert(KextError::LoadFailed(name, reason));
                }
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => {
                self.clear_relationships();
                Err(e)
            }
        }
    }

    /// Hand the personalities of a kext, and optionally its plugins, to the
    /// kernel link. Returns how many were sent.
    pub fn send_personalities(&mut self, id: KextId, include_plugins: bool) -> Result<usize> {
        let mut ids = vec![id];
        if include_plugins {
            let kext = self.kexts.get(id).ok_or(KextError::StaleHandle)?;
            ids.extend_from_slice(kext.plugins());
        }

        let mut personalities = Vec::new();
        for kid in ids {
            match self.realize_kext(kid) {
                Ok(()) => {}
                Err(KextError::CacheInconsistency(name)) => {
                    warn!("[KextManager] Skipping personalities of {}: cache inconsistent", name);
                    continue;
                }
                Err(e) => return Err(e),
            }
            let kext = self.kexts.get(kid).ok_or(KextError::StaleHandle)?;
            if !kext.is_valid() || !kext.is_enabled() {
                if kid == id {
                    return Err(KextError::Validation(kext.display_name()));
                }
                continue;
            }
            if self.config.safe_boot && !kext.is_eligible_during_safe_boot() {
                continue;
            }
            let identifier = kext.bundle_identifier().unwrap_or_default().to_string();
            if let Some(dictionary) = kext.personalities() {
                personalities.extend(collect_personalities(dictionary, &identifier));
            }
        }

        self.kernel.send_personalities(&personalities)?;
        debug!("[KextManager] Sent {} personalities", personalities.len());
        Ok(personalities.len())
    }
}

fn collect_personalities(personalities: &Dictionary, identifier: &str) -> Vec<Dictionary> {
    personalities
        .values()
        .filter_map(Value::as_dictionary)
        .map(|personality| {
            let mut personality = personality.clone();
            personality
                .entry(keys::BUNDLE_IDENTIFIER.to_string())
                .or_insert_with(|| Value::from(identifier));
            personality
        })
        .collect()
}
