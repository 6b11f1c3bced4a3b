// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ipc_service::{EntitlementCache, PackageManager, PackageMetadata};

/// A fixed set of loaded applications, counting how often the cache falls
/// back to it.
struct FixturePackageManager {
    apps: Vec<PackageMetadata>,
    lookups: AtomicUsize,
}

impl FixturePackageManager {
    fn new(apps: Vec<PackageMetadata>) -> FixturePackageManager {
        FixturePackageManager {
            apps,
            lookups: AtomicUsize::new(0),
        }
    }
}

impl PackageManager for FixturePackageManager {
    fn loaded_app_ids(&self) -> Vec<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.apps.iter().map(|app| app.app_id.clone()).collect()
    }

    fn metadata(&self, app_id: &str) -> Option<PackageMetadata> {
        self.apps.iter().find(|app| app.app_id == app_id).cloned()
    }
}

fn capability_fixture() -> PackageMetadata {
    let mut capabilities = HashMap::new();
    capabilities.insert(
        "svc1".to_string(),
        ["svc1.if1".to_string()].into_iter().collect::<HashSet<_>>(),
    );
    capabilities.insert("svc2".to_string(), HashSet::new());

    PackageMetadata {
        app_id: "com.example.app".to_string(),
        user_id: 1001,
        capabilities,
    }
}

#[test]
fn capability_map_gates_by_service_and_interface() {
    let manager = Arc::new(FixturePackageManager::new(vec![capability_fixture()]));
    let cache = EntitlementCache::new(manager);

    // named interface in a named service
    assert!(cache.is_allowed(1001, "svc1", "svc1.if1"));
    // empty interface set authorises every interface of that service
    assert!(cache.is_allowed(1001, "svc2", "anything"));

    assert!(!cache.is_allowed(1001, "svc1", "svc1.if2"));
    assert!(!cache.is_allowed(1001, "svc3", "svc1.if1"));

    cache.application_stopped(1001);
    assert!(!cache.is_allowed(1001, "svc1", "svc1.if1"));
    assert!(!cache.is_allowed(1001, "svc2", "anything"));
    assert!(!cache.is_allowed(1001, "svc1", "svc1.if2"));
    assert!(!cache.is_allowed(1001, "svc3", "svc1.if1"));
}

#[test]
fn wildcard_service_grants_everything() {
    let mut capabilities = HashMap::new();
    capabilities.insert("*".to_string(), HashSet::new());

    let manager = Arc::new(FixturePackageManager::new(vec![PackageMetadata {
        app_id: "com.example.trusted".to_string(),
        user_id: 2002,
        capabilities,
    }]));
    let cache = EntitlementCache::new(manager);

    assert!(cache.is_allowed(2002, "any.service", "any.interface"));
    assert!(cache.is_allowed(2002, "other.service", "other.interface"));
}

#[test]
fn unknown_uid_is_fetched_once_then_cached() {
    let manager = Arc::new(FixturePackageManager::new(vec![capability_fixture()]));
    let cache = EntitlementCache::new(manager.clone());

    assert!(cache.is_allowed(1001, "svc1", "svc1.if1"));
    assert_eq!(manager.lookups.load(Ordering::SeqCst), 1);

    // further lookups for the same uid are served from the cache
    assert!(cache.is_allowed(1001, "svc2", "whatever"));
    assert!(!cache.is_allowed(1001, "svc3", "whatever"));
    assert_eq!(manager.lookups.load(Ordering::SeqCst), 1);

    // eviction forces the slow path again
    cache.application_stopped(1001);
    assert!(cache.is_allowed(1001, "svc1", "svc1.if1"));
    assert_eq!(manager.lookups.load(Ordering::SeqCst), 2);
}

#[test]
fn whitelisted_interfaces_bypass_the_cache() {
    let manager = Arc::new(FixturePackageManager::new(vec![]));
    let cache = EntitlementCache::new(manager);

    assert!(cache.is_interface_whitelisted("org.freedesktop.DBus"));
    assert!(cache.is_interface_whitelisted("com.vendor.org.freedesktop.shim"));
    assert!(!cache.is_interface_whitelisted("com.example.private"));
}

#[test]
fn empty_capability_maps_are_not_installed() {
    let manager = Arc::new(FixturePackageManager::new(vec![]));
    let cache = EntitlementCache::new(manager);

    cache.add_entitlement(
        3003,
        &PackageMetadata {
            app_id: "com.example.broken".to_string(),
            user_id: 3003,
            capabilities: HashMap::new(),
        },
    );

    assert!(!cache.is_allowed(3003, "svc", "if"));
}
