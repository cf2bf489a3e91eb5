//! Permission graph collaborator.
//!
//! Event routing consults this interface to decide which operators may see
//! a device; the graph itself is owned by the external user/permission
//! layer and never extended here.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Read-only view over the user/device permission graph.
pub trait UserAccess: Send + Sync {
    /// Device ids visible to the user.
    fn devices_visible_to(&self, user_id: i64) -> HashSet<i64>;

    /// Whether the user holds the administrator role.
    fn is_admin(&self, user_id: i64) -> bool;

    /// Users that should receive updates for the device: all admins plus any
    /// user whose grants include it.
    fn users_for_device(&self, device_id: i64) -> HashSet<i64> {
        self.known_users()
            .into_iter()
            .filter(|&user| self.is_admin(user) || self.devices_visible_to(user).contains(&device_id))
            .collect()
    }

    /// All user ids the graph knows about.
    fn known_users(&self) -> Vec<i64>;
}

/// Static permission graph used by tests and single-tenant deployments.
#[derive(Default)]
pub struct StaticUserAccess {
    grants: RwLock<HashMap<i64, HashSet<i64>>>,
    admins: RwLock<HashSet<i64>>,
}

impl StaticUserAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: i64, device_id: i64) {
        self.grants
            .write()
            .unwrap()
            .entry(user_id)
            .or_default()
            .insert(device_id);
    }

    pub fn add_admin(&self, user_id: i64) {
        self.admins.write().unwrap().insert(user_id);
    }
}

impl UserAccess for StaticUserAccess {
    fn devices_visible_to(&self, user_id: i64) -> HashSet<i64> {
        self.grants
            .read()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.admins.read().unwrap().contains(&user_id)
    }

    fn known_users(&self) -> Vec<i64> {
        let grants = self.grants.read().unwrap();
        let admins = self.admins.read().unwrap();
        let mut users: HashSet<i64> = grants.keys().copied().collect();
        users.extend(admins.iter().copied());
        users.into_iter().collect()
    }
}
