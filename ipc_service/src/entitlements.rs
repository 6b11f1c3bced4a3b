// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-uid authorisation of incoming method calls, fed lazily from the
//! package manager's capability metadata.

use log::*;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Interfaces containing any of these substrings bypass the entitlement
/// check entirely.
pub const WHITELISTED_INTERFACES: &[&str] = &[
    "org.freedesktop", // .*
];

/// Capability metadata for one installed application.
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    pub app_id: String,
    pub user_id: u32,

    /// `service → set of interfaces` the app may call. A `"*"` service key
    /// grants everything; an empty interface set grants every interface of
    /// that service.
    pub capabilities: HashMap<String, HashSet<String>>,
}

/// The slice of the package manager this cache needs. Implemented by the
/// real package manager elsewhere in the system and by fixtures in tests.
pub trait PackageManager: Send + Sync {
    fn loaded_app_ids(&self) -> Vec<String>;
    fn metadata(&self, app_id: &str) -> Option<PackageMetadata>;
}

/// Cache of `uid → service → {interfaces}` rows, populated on demand and
/// purged when the owning application stops.
pub struct EntitlementCache {
    package_manager: Arc<dyn PackageManager>,
    entries: Mutex<HashMap<u32, HashMap<String, HashSet<String>>>>,
}

impl EntitlementCache {
    pub fn new(package_manager: Arc<dyn PackageManager>) -> EntitlementCache {
        EntitlementCache {
            package_manager,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Substring match against the process-wide whitelist. Not the cheapest
    /// form of lookup, but that is the price of the flexibility.
    pub fn is_interface_whitelisted(&self, interface: &str) -> bool {
        WHITELISTED_INTERFACES
            .iter()
            .any(|white| interface.contains(white))
    }

    /// Decides whether `uid` may call `interface` on `service`.
    ///
    /// An unknown uid triggers one lookup through the package manager: the
    /// loaded applications are enumerated and the one matching `uid` (if
    /// any) has its capability map installed, after which the decision is
    /// retried once.
    pub fn is_allowed(&self, uid: u32, service: &str, interface: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();

        if !entries.contains_key(&uid) {
            // a uid can legitimately be missing here: an already-installed
            // app started after a reboot never produced an install
            // notification, so fetch its capabilities now
            for app_id in self.package_manager.loaded_app_ids() {
                if let Some(metadata) = self.package_manager.metadata(&app_id) {
                    if metadata.user_id == uid {
                        insert_entitlement(&mut entries, uid, &metadata);
                        break;
                    }
                }
            }
        }

        let Some(services) = entries.get(&uid) else {
            warn!("uid {uid} is not registered in the capability cache");
            return false;
        };

        if services.contains_key("*") {
            debug!("all services/interfaces are enabled for uid {uid}");
            return true;
        }

        let Some(interfaces) = services.get(service) else {
            warn!("service {service} is not enabled for uid {uid}");
            return false;
        };

        if interfaces.is_empty() {
            debug!("all interfaces of {service} are enabled for uid {uid}");
            return true;
        }

        if interfaces.contains(interface) {
            debug!("{service} / {interface} is allowed for uid {uid}");
            true
        } else {
            warn!("interface {interface} is not enabled for uid {uid}");
            false
        }
    }

    /// Installs (or replaces) the capability row for `uid`.
    pub fn add_entitlement(&self, uid: u32, metadata: &PackageMetadata) {
        let mut entries = self.entries.lock().unwrap();
        insert_entitlement(&mut entries, uid, metadata);
    }

    /// Purges the capability row of a stopped application's uid.
    pub fn application_stopped(&self, uid: u32) {
        info!("removing uid {uid} from the capability cache");
        self.entries.lock().unwrap().remove(&uid);
    }
}

fn insert_entitlement(
    entries: &mut HashMap<u32, HashMap<String, HashSet<String>>>,
    uid: u32,
    metadata: &PackageMetadata,
) {
    if metadata.capabilities.is_empty() {
        // an empty capability map must carry at least a "*" row to mean
        // anything; installing it would deny everything while looking valid
        info!(
            "[{}] supplied an empty capability map and will not be able to use bus services",
            metadata.app_id
        );
        return;
    }

    entries.insert(uid, metadata.capabilities.clone());
}
