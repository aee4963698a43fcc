//! Integration tests for repository scanning and version relationships.
//!
//! Covers:
//! - Scanning a repository with one valid and one malformed bundle
//! - Plugin discovery and the no-nested-plugins rule
//! - Version chains across two repositories
//! - Rescans, resets and explicit-add repositories

mod common;

use common::{test_manager, BundleBuilder};
use kextkit::{DiagnosticKey, KextError, Version};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_scan_sorts_valid_and_malformed_bundles() {
    let dir = TempDir::new().unwrap();
    BundleBuilder::new("A.kext", "com.example.a", "1.0")
        .required("Root")
        .library("com.apple.kernel.bsd", "6.0")
        .write(dir.path());
    BundleBuilder::malformed("B.kext").write(dir.path());
    fs::create_dir(dir.path().join("NotAKext.bundle")).unwrap();

    let mut manager = test_manager();
    let repository_id = manager.add_repository(dir.path(), true, false).unwrap();
    let repository = manager.repository(repository_id).unwrap();
    assert_eq!(repository.candidate_kexts().len(), 1);
    assert_eq!(repository.bad_kexts().len(), 1);

    let a = repository.candidate_kexts()[0];
    let kext = manager.kext(a).unwrap();
    assert_eq!(kext.bundle_identifier(), Some("com.example.a"));
    assert!(kext.is_valid());
    assert!(kext.is_eligible_during_safe_boot());
    assert!(kext.can_resolve_dependencies());

    let b = repository.bad_kexts()[0];
    let kext = manager.kext(b).unwrap();
    assert!(!kext.is_valid());
    assert_eq!(
        kext.validation_failures().items(DiagnosticKey::MissingProperty),
        &["CFBundleIdentifier".to_string()]
    );
}

#[test]
fn test_two_repositories_form_one_chain() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    BundleBuilder::new("Foo.kext", "com.example.foo", "1.0").write(first.path());
    BundleBuilder::new("Foo.kext", "com.example.foo", "2.0").write(second.path());

    let mut manager = test_manager();
    manager.add_repository(first.path(), true, false).unwrap();
    manager.add_repository(second.path(), true, false).unwrap();

    let head = manager.kext_with_identifier("com.example.foo").unwrap().unwrap();
    let head_kext = manager.kext(head).unwrap();
    assert_eq!(head_kext.version(), Version::parse("2.0").ok());

    let prior = head_kext.prior_version().unwrap();
    assert_eq!(manager.kext(prior).unwrap().version(), Version::parse("1.0").ok());
    assert_eq!(manager.kext(prior).unwrap().prior_version(), None);
    assert_eq!(manager.kexts_with_identifier("com.example.foo").unwrap(), vec![head, prior]);
}

#[test]
fn test_equal_versions_become_duplicates() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    BundleBuilder::new("Foo.kext", "com.example.foo", "1.0").write(first.path());
    BundleBuilder::new("Foo.kext", "com.example.foo", "1.0").write(second.path());

    let mut manager = test_manager();
    manager.add_repository(first.path(), true, false).unwrap();
    manager.add_repository(second.path(), true, false).unwrap();

    let head = manager.kext_with_identifier("com.example.foo").unwrap().unwrap();
    let duplicate = manager.kext(head).unwrap().next_duplicate().unwrap();
    assert_ne!(head, duplicate);
    assert_eq!(manager.kext(head).unwrap().prior_version(), None);
    assert_eq!(manager.kexts_with_identifier("com.example.foo").unwrap().len(), 2);
}

#[test]
fn test_plugins_are_discovered() {
    let dir = TempDir::new().unwrap();
    BundleBuilder::new("Family.kext", "com.example.family", "1.0")
        .plugin(BundleBuilder::new("Driver.kext", "com.example.family.driver", "1.0"))
        .write(dir.path());

    let mut manager = test_manager();
    manager.add_repository(dir.path(), true, false).unwrap();
    let family = manager.kext_with_identifier("com.example.family").unwrap().unwrap();
    let driver = manager
        .kext_with_identifier("com.example.family.driver")
        .unwrap()
        .unwrap();
    assert_eq!(manager.kext(family).unwrap().plugins(), &[driver]);
    assert_eq!(manager.kext(driver).unwrap().container(), Some(family));
}

#[test]
fn test_nested_plugins_invalidate_plugin() {
    let dir = TempDir::new().unwrap();
    BundleBuilder::new("Family.kext", "com.example.family", "1.0")
        .plugin(
            BundleBuilder::new("Driver.kext", "com.example.driver", "1.0")
                .plugin(BundleBuilder::new("Nested.kext", "com.example.nested", "1.0")),
        )
        .write(dir.path());

    let mut manager = test_manager();
    manager.add_repository(dir.path(), true, false).unwrap();
    assert_eq!(manager.all_kexts().len(), 2);
    assert!(manager.kext_with_identifier("com.example.nested").unwrap().is_none());
    assert!(manager.kext_with_identifier("com.example.driver").unwrap().is_none());

    let driver = manager
        .all_kexts()
        .into_iter()
        .find(|id| manager.kext(*id).unwrap().is_plugin())
        .unwrap();
    assert!(manager
        .kext(driver)
        .unwrap()
        .validation_failures()
        .contains(DiagnosticKey::PluginContainsPlugins));
}

#[test]
fn test_rescan_removes_vanished_bundle_with_plugins() {
    let dir = TempDir::new().unwrap();
    let family = BundleBuilder::new("Family.kext", "com.example.family", "1.0")
        .plugin(BundleBuilder::new("Driver.kext", "com.example.driver", "1.0"))
        .write(dir.path());
    BundleBuilder::new("Other.kext", "com.example.other", "1.0").write(dir.path());

    let mut manager = test_manager();
    let id = manager.add_repository(dir.path(), true, false).unwrap();
    assert_eq!(manager.all_kexts().len(), 3);

    fs::remove_dir_all(&family).unwrap();
    let outcome = manager.rescan_repository(id).unwrap();
    assert_eq!(outcome.removed.len(), 2);
    assert!(outcome.added.is_empty());
    assert_eq!(manager.all_kexts().len(), 1);
    assert!(manager.kext_with_identifier("com.example.driver").unwrap().is_none());
}

#[test]
fn test_reset_explicit_repository_rereads_disk() {
    let dir = TempDir::new().unwrap();
    let bundle = BundleBuilder::new("A.kext", "com.example.a", "1.0").write(dir.path());
    BundleBuilder::new("B.kext", "com.example.b", "1.0").write(dir.path());

    let mut manager = test_manager();
    manager.add_kext(&bundle, false).unwrap();
    BundleBuilder::new("A.kext", "com.example.a", "2.0").write(dir.path());

    let repository_id = manager.repositories()[0];
    manager.reset_repository(repository_id).unwrap();
    assert_eq!(manager.all_kexts().len(), 1);
    let head = manager.kext_with_identifier("com.example.a").unwrap().unwrap();
    assert_eq!(manager.kext(head).unwrap().version(), Version::parse("2.0").ok());
    assert!(manager.kext_with_identifier("com.example.b").unwrap().is_none());
}

#[test]
fn test_add_kext_outside_bundle_is_structural() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain.kext");
    fs::write(&file, b"not a directory").unwrap();

    let mut manager = test_manager();
    let result = manager.add_kext(&file, false);
    assert!(matches!(result, Err(KextError::NotABundle(_))));
    assert!(manager.all_kexts().is_empty());

    let missing = manager.add_kext(&dir.path().join("Missing.kext"), false);
    assert!(matches!(missing, Err(KextError::FileNotFound(_))));
}

#[test]
fn test_failed_add_kext_drops_new_repository() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("plain.kext");
    fs::write(&file, b"not a directory").unwrap();
    let bundle = BundleBuilder::new("A.kext", "com.example.a", "1.0").write(dir.path());

    let mut manager = test_manager();
    assert!(manager.add_kext(&file, false).is_err());
    assert!(manager.repositories().is_empty());
    assert!(manager.repository_with_path(dir.path()).is_none());

    let a = manager.add_kext(&bundle, false).unwrap();
    let repository = manager.kext(a).unwrap().repository();
    assert!(manager.add_kext(&file, false).is_err());
    assert_eq!(manager.repositories(), &[repository]);
    assert_eq!(manager.kext_with_identifier("com.example.a").unwrap(), Some(a));
}

#[test]
fn test_safe_boot_filters_chains() {
    let dir = TempDir::new().unwrap();
    BundleBuilder::new("Root.kext", "com.example.root", "1.0")
        .required("Root")
        .write(dir.path());
    BundleBuilder::new("Late.kext", "com.example.late", "1.0").write(dir.path());

    let mut manager = test_manager();
    manager.add_repository(dir.path(), true, false).unwrap();
    assert!(manager.kext_with_identifier("com.example.late").unwrap().is_some());

    manager.set_safe_boot(true);
    assert!(manager.kext_with_identifier("com.example.late").unwrap().is_none());
    assert!(manager.kext_with_identifier("com.example.root").unwrap().is_some());
}
