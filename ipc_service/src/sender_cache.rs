// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Cache of bus sender names to unix uids, kept honest by watching the
//! daemon's `NameOwnerChanged` signal for peers leaving the bus.

use log::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::entitlements::EntitlementCache;
use crate::service::IpcService;
use crate::{process_val, Signal, VariantList};

pub struct SenderUidCache {
    entries: Mutex<HashMap<String, u32>>,
    entitlements: Arc<EntitlementCache>,
}

impl SenderUidCache {
    /// Builds the cache and subscribes it to `NameOwnerChanged` on
    /// `service`. When a cached sender leaves the bus its mapping is erased
    /// and the entitlement cache is told the application stopped.
    pub fn new(service: &IpcService, entitlements: Arc<EntitlementCache>) -> Arc<SenderUidCache> {
        let cache = Arc::new(SenderUidCache {
            entries: Mutex::new(HashMap::new()),
            entitlements,
        });

        let weak = Arc::downgrade(&cache);
        let signal = Signal::new(
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "NameOwnerChanged",
        );
        let registration = service.register_signal_handler(
            &signal,
            Arc::new(move |args| {
                if let Some(cache) = weak.upgrade() {
                    cache.name_owner_changed(&args);
                }
            }),
        );
        if let Err(e) = registration {
            error!(
                "failed to register for NameOwnerChanged ({e}); stale sender-to-uid \
                 mappings will not be evicted"
            );
        }

        cache
    }

    /// The cached uid for `sender`, if any.
    pub fn user_id(&self, sender: &str) -> Option<u32> {
        self.entries.lock().unwrap().get(sender).copied()
    }

    pub fn add_sender_uid(&self, sender: &str, uid: u32) {
        info!("assigning sender {sender} to uid {uid}");
        self.entries.lock().unwrap().insert(sender.to_string(), uid);
    }

    fn remove(&self, sender: &str) {
        let removed = self.entries.lock().unwrap().remove(sender);
        if let Some(uid) = removed {
            info!("removing cached sender {sender}");
            // the app behind the uid is gone, its entitlement row goes too
            self.entitlements.application_stopped(uid);
        }
    }

    fn name_owner_changed(&self, args: &VariantList) {
        let parsed = (
            process_val::<String>(args, 0),
            process_val::<String>(args, 1),
            process_val::<String>(args, 2),
        );
        let (Ok(name), Ok(old_owner), Ok(new_owner)) = parsed else {
            error!("error getting the NameOwnerChanged arguments");
            return;
        };

        debug!("NameOwnerChanged('{name}', '{old_owner}', '{new_owner}')");

        // a unique name with no new owner means the client left the bus
        if name == old_owner && new_owner.is_empty() {
            info!("bus client '{name}' has left the bus");
            self.remove(&name);
        }
    }
}
