//! Kext metadata validation.
//!
//! Checks run in a fixed order against the info dictionary. Under
//! `CheckPolicy::FailFast` the first failure ends validation; under
//! `CheckPolicy::Exhaustive` every check runs and executable checks are
//! added. Warnings never affect validity.

use super::diagnostics::{Checker, DiagnosticKey, Halt};
use super::{is_kernel_library, is_kpi_library, keys, CheckContext, Kext, KmodLookup};
use crate::error::{KextError, Result};
use crate::models::{BootRequirement, KernelResourceKind};
use crate::plist::{Dictionary, Value};
use crate::version::{Version, KMOD_MAX_NAME};
use log::debug;

/// Why checking stopped early.
enum Stop {
    Halted,
    Failed(KextError),
}

impl From<Halt> for Stop {
    fn from(_: Halt) -> Self {
        Stop::Halted
    }
}

impl From<std::io::Error> for Stop {
    fn from(e: std::io::Error) -> Self {
        Stop::Failed(e.into())
    }
}

/// Personality counts gathered for safe-boot eligibility.
#[derive(Default)]
struct PersonalityCounts {
    total: usize,
    debugging: usize,
}

impl Kext {
    /// Validate the kext's metadata, replacing any earlier validation
    /// results.
    ///
    /// Sets `is_valid` iff no failures were recorded and returns
    /// `KextError::Validation` otherwise. IO errors while inspecting the
    /// executable are returned as-is.
    pub fn validate(&mut self, ctx: &CheckContext<'_>) -> Result<()> {
        self.reset_validation_state();

        let mut failures = std::mem::take(&mut self.validation_failures);
        let mut warnings = std::mem::take(&mut self.warnings);
        let info = self.info.take();

        let (outcome, count) = {
            let mut checker = Checker::with_warnings(&mut failures, &mut warnings, ctx.policy);
            let outcome = self.run_checks(info.as_ref(), &mut checker, ctx);
            (outcome, checker.failures())
        };

        self.info = info;
        self.validation_failures = failures;
        self.warnings = warnings;

        match outcome {
            Err(Stop::Failed(e)) => {
                self.flags.is_valid = false;
                Err(e)
            }
            Ok(()) | Err(Stop::Halted) => {
                self.flags.is_valid = count == 0;
                if self.flags.is_valid {
                    Ok(())
                } else {
                    debug!("[Validator] {} failed validation", self.display_name());
                    Err(KextError::Validation(self.display_name()))
                }
            }
        }
    }

    fn reset_validation_state(&mut self) {
        self.validation_failures.clear();
        self.warnings.remove(DiagnosticKey::NonUniqueIOResourcesMatch);
        self.warnings.remove(DiagnosticKey::KernelAndKpiDependencies);
        self.warnings.remove(DiagnosticKey::KmodInfoMismatch);
        self.bundle_identifier = None;
        self.version = None;
        self.compatible_version = None;
        self.kernel_resource = KernelResourceKind::NotKernelResource;
        self.flags.is_valid = false;
        self.flags.declares_executable = false;
        self.flags.is_eligible_during_safe_boot = false;
        self.flags.can_authenticate = false;
        self.flags.can_resolve_dependencies = false;
        self.flags.has_iokit_debug_property = false;
    }

    fn run_checks(
        &mut self,
        info: Option<&Dictionary>,
        checker: &mut Checker<'_>,
        ctx: &CheckContext<'_>,
    ) -> std::result::Result<(), Stop> {
        let info = match info {
            Some(info) => info,
            None => {
                checker.fail(DiagnosticKey::InfoDictionaryMissing, None)?;
                return Ok(());
            }
        };
        self.flags.can_authenticate = true;
        let mut resolvable = true;

        resolvable &= self.check_identifier(info, checker)?;
        if !self.from_cache {
            check_package_type(info, checker)?;
        }
        if let Some(value) = info.get(keys::DEBUG_LEVEL) {
            if !matches!(value, Value::Integer(_)) {
                checker.fail(DiagnosticKey::IllegalType, Some(keys::DEBUG_LEVEL))?;
            }
        }
        resolvable &= self.check_versions(info, checker)?;
        self.check_executable_and_resource(info, checker)?;

        let counts = if self.from_cache {
            PersonalityCounts::default()
        } else {
            check_personalities(info, checker)?
        };

        resolvable &= self.check_libraries(info, checker)?;
        self.check_boot_requirement(info, checker, &counts)?;

        if ctx.policy.is_exhaustive() {
            self.check_executable_file(checker, ctx)?;
        }

        self.flags.can_resolve_dependencies = resolvable;
        Ok(())
    }

    fn check_identifier(
        &mut self,
        info: &Dictionary,
        checker: &mut Checker<'_>,
    ) -> std::result::Result<bool, Halt> {
        match info.get(keys::BUNDLE_IDENTIFIER) {
            None => {
                checker.fail(DiagnosticKey::MissingProperty, Some(keys::BUNDLE_IDENTIFIER))?;
                Ok(false)
            }
            Some(Value::String(identifier))
                if !identifier.is_empty() && identifier.len() < KMOD_MAX_NAME =>
            {
                self.bundle_identifier = Some(identifier.clone());
                Ok(true)
            }
            Some(Value::String(_)) => {
                checker.fail(DiagnosticKey::IllegalValue, Some(keys::BUNDLE_IDENTIFIER))?;
                Ok(false)
            }
            Some(_) => {
                checker.fail(DiagnosticKey::IllegalType, Some(keys::BUNDLE_IDENTIFIER))?;
                Ok(false)
            }
        }
    }

    fn check_versions(
        &mut self,
        info: &Dictionary,
        checker: &mut Checker<'_>,
    ) -> std::result::Result<bool, Halt> {
        let mut ok = true;
        match info.get(keys::BUNDLE_VERSION) {
            None => {
                checker.fail(DiagnosticKey::MissingProperty, Some(keys::BUNDLE_VERSION))?;
                ok = false;
            }
            Some(Value::String(text)) => match Version::parse(text) {
                Ok(version) => self.version = Some(version),
                Err(_) => {
                    checker.fail(DiagnosticKey::IllegalValue, Some(keys::BUNDLE_VERSION))?;
                    ok = false;
                }
            },
            Some(_) => {
                checker.fail(DiagnosticKey::IllegalType, Some(keys::BUNDLE_VERSION))?;
                ok = false;
            }
        }

        match info.get(keys::COMPATIBLE_VERSION) {
            None => {}
            Some(Value::String(text)) => match Version::parse(text) {
                Ok(compatible) if self.version.map_or(true, |v| compatible <= v) => {
                    self.compatible_version = Some(compatible);
                }
                _ => {
                    checker.fail(DiagnosticKey::IllegalValue, Some(keys::COMPATIBLE_VERSION))?;
                    ok = false;
                }
            },
            Some(_) => {
                checker.fail(DiagnosticKey::IllegalType, Some(keys::COMPATIBLE_VERSION))?;
                ok = false;
            }
        }
        Ok(ok)
    }

    fn check_executable_and_resource(
        &mut self,
        info: &Dictionary,
        checker: &mut Checker<'_>,
    ) -> std::result::Result<(), Halt> {
        match info.get(keys::EXECUTABLE) {
            None => {}
            Some(Value::String(name)) if !name.is_empty() => self.flags.declares_executable = true,
            Some(Value::String(_)) => {
                checker.fail(DiagnosticKey::IllegalValue, Some(keys::EXECUTABLE))?;
            }
            Some(_) => checker.fail(DiagnosticKey::IllegalType, Some(keys::EXECUTABLE))?,
        }

        match info.get(keys::KERNEL_RESOURCE) {
            None | Some(Value::Boolean(false)) => {}
            Some(Value::Boolean(true)) => {
                self.kernel_resource = if self.flags.declares_executable {
                    KernelResourceKind::SharedExecutable
                } else {
                    KernelResourceKind::Pseudo
                };
            }
            Some(_) => checker.fail(DiagnosticKey::IllegalType, Some(keys::KERNEL_RESOURCE))?,
        }
        Ok(())
    }

    fn check_libraries(
        &mut self,
        info: &Dictionary,
        checker: &mut Checker<'_>,
    ) -> std::result::Result<bool, Halt> {
        let needs_libraries = self.flags.declares_executable && !self.is_kernel_resource();
        let libraries = match info.get(keys::LIBRARIES) {
            None => {
                if needs_libraries {
                    checker.fail(DiagnosticKey::MissingProperty, Some(keys::LIBRARIES))?;
                    return Ok(false);
                }
                return Ok(true);
            }
            Some(Value::Dictionary(libraries)) => libraries,
            Some(_) => {
                checker.fail(DiagnosticKey::IllegalType, Some(keys::LIBRARIES))?;
                return Ok(false);
            }
        };

        let mut ok = true;
        if libraries.is_empty() && needs_libraries {
            checker.fail(DiagnosticKey::IllegalValue, Some(keys::LIBRARIES))?;
            ok = false;
        }

        let mut kernel_component = false;
        let mut kpi = false;
        for (identifier, value) in libraries {
            let path = format!("{}:{}", keys::LIBRARIES, identifier);
            match value {
                Value::String(text) if Version::parse(text).is_ok() => {
                    kernel_component |= is_kernel_library(identifier);
                    kpi |= is_kpi_library(identifier);
                }
                Value::String(_) => {
                    checker.fail(DiagnosticKey::IllegalValue, Some(&path))?;
                    ok = false;
                }
                _ => {
                    checker.fail(DiagnosticKey::IllegalType, Some(&path))?;
                    ok = false;
                }
            }
        }
        if kernel_component && kpi {
            checker.warn(DiagnosticKey::KernelAndKpiDependencies, None);
        }
        Ok(ok)
    }

    fn check_boot_requirement(
        &mut self,
        info: &Dictionary,
        checker: &mut Checker<'_>,
        counts: &PersonalityCounts,
    ) -> std::result::Result<(), Halt> {
        let mut eligible = false;
        match info.get(keys::BUNDLE_REQUIRED) {
            None => {}
            Some(Value::String(text)) => match text.parse::<BootRequirement>() {
                Ok(requirement) => eligible = requirement.is_early_boot(),
                Err(_) => checker.fail(DiagnosticKey::IllegalValue, Some(keys::BUNDLE_REQUIRED))?,
            },
            Some(_) => checker.fail(DiagnosticKey::IllegalType, Some(keys::BUNDLE_REQUIRED))?,
        }

        // Kexts whose every personality is a debug personality stay out of safe boot.
        if counts.total > 0 && counts.debugging == counts.total {
            eligible = false;
        }
        self.flags.is_eligible_during_safe_boot = eligible;
        self.flags.has_iokit_debug_property = counts.debugging > 0;
        Ok(())
    }

    fn check_executable_file(
        &mut self,
        checker: &mut Checker<'_>,
        ctx: &CheckContext<'_>,
    ) -> std::result::Result<(), Stop> {
        if !self.flags.declares_executable || self.kernel_resource == KernelResourceKind::Pseudo {
            return Ok(());
        }
        let (name, path) = match (self.executable_name(), self.executable_path()) {
            (Some(name), Some(path)) => (name.to_string(), path),
            _ => return Ok(()),
        };
        if !path.is_file() {
            checker.fail(DiagnosticKey::ExecutableMissing, Some(&name))?;
            return Ok(());
        }
        if self.is_kernel_resource() {
            return Ok(());
        }

        match ctx.inspector.kmod_info(&path)? {
            KmodLookup::Found(kmod) => {
                if needs_kmod_cross_check(self.compatible_version) {
                    let name_matches = self.bundle_identifier.as_deref() == Some(kmod.name.as_str());
                    let version_matches = Version::parse(&kmod.version).ok() == self.version;
                    if !name_matches || !version_matches {
                        checker.warn(
                            DiagnosticKey::KmodInfoMismatch,
                            Some(&format!("{} {}", kmod.name, kmod.version)),
                        );
                    }
                }
            }
            KmodLookup::Missing => {
                checker.fail(DiagnosticKey::ExecutableLacksKmodInfo, Some(&name))?;
            }
            KmodLookup::Unavailable => {
                debug!("[Validator] kmod_info not inspected for {}", path.display());
            }
        }
        Ok(())
    }
}

/// Kexts declaring no compatible version, or one below 1.0, predate
/// `OSBundleCompatibleVersion` as the source of truth and must agree with
/// their kmod_info.
fn needs_kmod_cross_check(compatible: Option<Version>) -> bool {
    match compatible {
        None => true,
        Some(compatible) => Version::parse("1.0")
            .map(|one| compatible < one)
            .unwrap_or(false),
    }
}

fn check_package_type(info: &Dictionary, checker: &mut Checker<'_>) -> std::result::Result<(), Halt> {
    match info.get(keys::PACKAGE_TYPE) {
        None => checker.fail(DiagnosticKey::MissingProperty, Some(keys::PACKAGE_TYPE)),
        Some(Value::String(kind)) if kind == keys::KEXT_PACKAGE_TYPE => Ok(()),
        Some(Value::String(_)) => checker.fail(DiagnosticKey::IllegalValue, Some(keys::PACKAGE_TYPE)),
        Some(_) => checker.fail(DiagnosticKey::IllegalType, Some(keys::PACKAGE_TYPE)),
    }
}

fn check_personalities(
    info: &Dictionary,
    checker: &mut Checker<'_>,
) -> std::result::Result<PersonalityCounts, Halt> {
    let mut counts = PersonalityCounts::default();
    let personalities = match info.get(keys::PERSONALITIES) {
        None => return Ok(counts),
        Some(Value::Dictionary(personalities)) => personalities,
        Some(_) => {
            checker.fail(DiagnosticKey::IllegalType, Some(keys::PERSONALITIES))?;
            return Ok(counts);
        }
    };

    for (name, value) in personalities {
        let path = format!("{}:{}", keys::PERSONALITIES, name);
        let personality = match value {
            Value::Dictionary(personality) => personality,
            _ => {
                checker.fail(DiagnosticKey::IllegalType, Some(&path))?;
                continue;
            }
        };
        counts.total += 1;

        for key in [keys::IO_CLASS, keys::IO_PROVIDER_CLASS] {
            let property = format!("{}:{}", path, key);
            match personality.get(key) {
                None => checker.fail(DiagnosticKey::MissingProperty, Some(&property))?,
                Some(Value::String(_)) => {}
                Some(_) => checker.fail(DiagnosticKey::IllegalType, Some(&property))?,
            }
        }

        for bad in value.non_kernel_values(&path) {
            checker.fail(DiagnosticKey::IllegalType, Some(&bad))?;
        }

        if let Some(Value::Integer(level)) = personality.get(keys::IOKIT_DEBUG) {
            if *level != 0 {
                counts.debugging += 1;
            }
        }

        let matches_resources = personality
            .get(keys::IO_PROVIDER_CLASS)
            .and_then(Value::as_str)
            == Some(keys::IO_RESOURCES);
        if matches_resources && !personality.contains_key(keys::IO_MATCH_CATEGORY) {
            checker.warn(DiagnosticKey::NonUniqueIOResourcesMatch, Some(name));
        }
    }
    Ok(counts)
}
