/// Manager collaborators: user interaction callbacks and the kernel link.
///
/// `KextCallbacks` carries the user-facing side of an operation (messages,
/// approval, veto, input). `KernelLink` is the boundary to the running
/// kernel: it reports loaded modules and performs loads.

use crate::dgraph::DependencyGraph;
use crate::models::LoadedKextInfo;
use crate::plist::Dictionary;
use std::io;

/// User interaction hooks.
///
/// Defaults never let an operation through unattended: `approve` answers
/// no, `veto` answers yes and `input` returns nothing. The supplied default
/// is the answer an interactive front end should preselect.
pub trait KextCallbacks {
    fn log(&self, message: &str) {
        log::info!(target: "kext", "{}", message);
    }

    /// Ask before doing something; `true` means go ahead.
    fn approve(&self, _default: bool, _prompt: &str) -> bool {
        false
    }

    /// Offer to stop something; `true` means vetoed.
    fn veto(&self, _default: bool, _prompt: &str) -> bool {
        true
    }

    fn input(&self, _prompt: &str) -> Option<String> {
        None
    }
}

/// Callbacks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCallbacks;

impl KextCallbacks for DefaultCallbacks {}

/// How one load request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { load_address: u64 },
    Failed(String),
}

/// Boundary to the running kernel.
pub trait KernelLink {
    /// Snapshot of the modules currently loaded.
    fn loaded_modules(&self) -> io::Result<Vec<LoadedKextInfo>>;

    /// Load the graph's root and any dependencies not yet loaded. One
    /// outcome per graph entry, in graph order.
    fn load(&mut self, graph: &DependencyGraph, in_task: bool) -> io::Result<Vec<LoadOutcome>>;

    /// Publish driver personalities for matching.
    fn send_personalities(&mut self, _personalities: &[Dictionary]) -> io::Result<()> {
        Ok(())
    }
}

/// Kernel link for hosts without a kernel to talk to: nothing is loaded and
/// every load fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedKernelLink;

impl KernelLink for DetachedKernelLink {
    fn loaded_modules(&self) -> io::Result<Vec<LoadedKextInfo>> {
        Ok(Vec::new())
    }

    fn load(&mut self, graph: &DependencyGraph, _in_task: bool) -> io::Result<Vec<LoadOutcome>> {
        Ok(graph
            .entries()
            .iter()
            .map(|_| LoadOutcome::Failed("no kernel link available".to_string()))
            .collect())
    }
}
