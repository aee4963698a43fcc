//! Kext authentication: ownership and permission checks of bundle files.

use super::diagnostics::{CheckPolicy, Checker, DiagnosticKey, Halt};
use super::Kext;
use crate::error::{KextError, Result};
use crate::system;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};

/// Who must own kext files, and how much of the bundle is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationPolicy {
    /// Check the info file, the executable and every ancestor directory
    /// below the repository root instead of only the bundle directory.
    pub strict: bool,
    pub owner_uid: u32,
    pub owner_gid: u32,
}

impl Default for AuthenticationPolicy {
    fn default() -> Self {
        AuthenticationPolicy {
            strict: true,
            owner_uid: 0,
            owner_gid: 0,
        }
    }
}

impl AuthenticationPolicy {
    /// Require files to belong to the calling process's user and group.
    pub fn for_current_owner(strict: bool) -> Self {
        let (owner_uid, owner_gid) = system::current_owner();
        AuthenticationPolicy {
            strict,
            owner_uid,
            owner_gid,
        }
    }
}

enum Stop {
    Halted,
    Failed(io::Error),
}

impl From<Halt> for Stop {
    fn from(_: Halt) -> Self {
        Stop::Halted
    }
}

impl Kext {
    /// Authenticate the kext's files against `auth`, replacing earlier
    /// authentication results.
    ///
    /// Missing files and files with the wrong owner, group or permissions
    /// are recorded as authentication failures. Any other IO error aborts
    /// immediately.
    pub fn authenticate(
        &mut self,
        repository_path: &Path,
        policy: CheckPolicy,
        auth: &AuthenticationPolicy,
    ) -> Result<()> {
        self.authentication_failures.clear();
        self.flags.is_authentic = false;

        let paths = self.files_to_authenticate(repository_path, auth.strict);
        let mut failures = std::mem::take(&mut self.authentication_failures);
        let (outcome, count) = {
            let mut checker = Checker::new(&mut failures, policy);
            let outcome = check_paths(&paths, &mut checker, auth);
            (outcome, checker.failures())
        };
        self.authentication_failures = failures;
        self.flags.has_been_authenticated = true;

        if let Err(Stop::Failed(e)) = outcome {
            return Err(KextError::Io(e));
        }
        self.flags.is_authentic = count == 0;
        if self.flags.is_authentic {
            Ok(())
        } else {
            debug!("[Auth] {} failed authentication", self.display_name());
            Err(KextError::Authentication(self.display_name()))
        }
    }

    /// The bundle directory, then in strict mode the info file, the
    /// executable and all ancestor directories strictly below the
    /// repository root.
    fn files_to_authenticate(&self, repository_path: &Path, strict: bool) -> Vec<PathBuf> {
        let mut paths = vec![self.bundle_path.clone()];
        if !strict {
            return paths;
        }

        let layout = self.layout();
        let mut files = vec![layout.info_plist()];
        if let Some(executable) = self.executable_path() {
            files.push(executable);
        }

        let mut ancestors = Vec::new();
        for file in &files {
            for ancestor in file.ancestors().skip(1) {
                if !ancestor.starts_with(repository_path) || ancestor == repository_path {
                    break;
                }
                let ancestor = ancestor.to_path_buf();
                if ancestor != self.bundle_path && !ancestors.contains(&ancestor) {
                    ancestors.push(ancestor);
                }
            }
        }
        paths.extend(files);
        paths.extend(ancestors);
        paths
    }
}

fn check_paths(
    paths: &[PathBuf],
    checker: &mut Checker<'_>,
    auth: &AuthenticationPolicy,
) -> std::result::Result<(), Stop> {
    for path in paths {
        let item = path.display().to_string();
        match system::stat(path) {
            Ok(status) => {
                let wrong_owner = status.uid != auth.owner_uid || status.gid != auth.owner_gid;
                if wrong_owner || status.is_group_or_other_writable() {
                    checker.fail(DiagnosticKey::OwnerPermissions, Some(&item))?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                checker.fail(DiagnosticKey::FileAccess, Some(&item))?;
            }
            Err(e) => return Err(Stop::Failed(e)),
        }
    }
    Ok(())
}
