//! Bookkeeping entries stored in a VM's `other_config`.
//!
//! The toolstack has no notion of "inherited from the template" or "declared
//! by the user", so the VM reconciler records both in reserved `tf_` keys on
//! the VM itself. [`OtherConfig`] is the only place that reads or writes them.

use crate::error::{ProviderError, Result};
use crate::xapi::OpaqueRef;
use crate::xapi::records::StringMap;

/// VBD references the VM got from its template, comma separated.
pub const TEMPLATE_VBDS: &str = "tf_template_vbds";
/// Keys of the user-declared entries, comma separated.
pub const USER_KEYS: &str = "tf_other_config_keys";
/// Guest IP wait in seconds.
pub const CHECK_IP_TIMEOUT: &str = "tf_check_ip_timeout";
/// Name of the template the VM was cloned from.
pub const TEMPLATE_NAME: &str = "tf_template_name";

pub const RESERVED_KEYS: [&str; 4] = [TEMPLATE_VBDS, USER_KEYS, CHECK_IP_TIMEOUT, TEMPLATE_NAME];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

fn split_list(value: Option<&String>) -> impl Iterator<Item = &str> {
    value
        .map(String::as_str)
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
}

/// A VM's `other_config` map with typed access to the reserved entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OtherConfig(StringMap);

impl OtherConfig {
    pub fn new(map: StringMap) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &StringMap {
        &self.0
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn template_vbds(&self) -> Vec<OpaqueRef> {
        split_list(self.0.get(TEMPLATE_VBDS))
            .map(OpaqueRef::new)
            .collect()
    }

    /// Record the template's disks. Nothing is stored for a diskless template.
    pub fn set_template_vbds(&mut self, vbds: &[OpaqueRef]) {
        if vbds.is_empty() {
            return;
        }
        let joined = vbds
            .iter()
            .map(OpaqueRef::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.0.insert(TEMPLATE_VBDS.to_string(), joined);
    }

    /// Entries the user declared; reserved keys never show up here.
    pub fn user_entries(&self) -> StringMap {
        let keys: Vec<&str> = split_list(self.0.get(USER_KEYS)).collect();
        self.0
            .iter()
            .filter(|(k, _)| keys.contains(&k.as_str()) && !is_reserved(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Replace the previously declared entries with `desired`, leaving
    /// everything the user never declared untouched.
    pub fn apply_user_entries(&mut self, desired: &StringMap) -> Result<()> {
        if let Some(key) = desired.keys().find(|k| is_reserved(k) || k.contains(',')) {
            return Err(ProviderError::invalid(
                "other_config",
                key,
                "key is reserved for provider bookkeeping",
            ));
        }
        let previous: Vec<String> = split_list(self.0.get(USER_KEYS))
            .map(str::to_string)
            .collect();
        for key in previous {
            self.0.remove(&key);
        }
        self.0.extend(desired.iter().map(|(k, v)| (k.clone(), v.clone())));
        let keys = desired.keys().cloned().collect::<Vec<_>>().join(",");
        self.0.insert(USER_KEYS.to_string(), keys);
        Ok(())
    }

    /// Guest IP wait in seconds; 0 when unset or unreadable.
    pub fn check_ip_timeout(&self) -> u64 {
        self.0
            .get(CHECK_IP_TIMEOUT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_check_ip_timeout(&mut self, seconds: u64) {
        self.0
            .insert(CHECK_IP_TIMEOUT.to_string(), seconds.to_string());
    }

    pub fn template_name(&self) -> Option<&str> {
        self.0.get(TEMPLATE_NAME).map(String::as_str)
    }

    pub fn set_template_name(&mut self, name: &str) {
        self.0.insert(TEMPLATE_NAME.to_string(), name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> StringMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trip_hides_reserved_keys() {
        let mut config = OtherConfig::new(map(&[("base_template_name", "Debian")]));
        config.set_template_vbds(&[OpaqueRef::new("OpaqueRef:a"), OpaqueRef::new("OpaqueRef:b")]);
        config.set_check_ip_timeout(60);
        config.set_template_name("Debian Bookworm 12");
        config
            .apply_user_entries(&map(&[("owner", "ops"), ("tier", "web")]))
            .unwrap();

        assert_eq!(config.user_entries(), map(&[("owner", "ops"), ("tier", "web")]));
        assert_eq!(config.template_vbds().len(), 2);
        assert_eq!(config.check_ip_timeout(), 60);
        assert_eq!(config.template_name(), Some("Debian Bookworm 12"));
        assert_eq!(config.as_map()["base_template_name"], "Debian");
    }

    #[test]
    fn replacing_entries_drops_undeclared_ones() {
        let mut config = OtherConfig::default();
        config.apply_user_entries(&map(&[("a", "1"), ("b", "2")])).unwrap();
        config.apply_user_entries(&map(&[("b", "3")])).unwrap();
        assert_eq!(config.user_entries(), map(&[("b", "3")]));
        assert!(!config.as_map().contains_key("a"));
    }

    #[test]
    fn reserved_keys_cannot_be_declared() {
        let mut config = OtherConfig::default();
        let err = config
            .apply_user_entries(&map(&[(TEMPLATE_VBDS, "OpaqueRef:x")]))
            .unwrap_err();
        assert_eq!(err.attribute(), Some("other_config"));
        assert!(config.as_map().is_empty());
    }

    #[test]
    fn forged_key_list_cannot_surface_reserved_entries() {
        let config = OtherConfig::new(map(&[
            (USER_KEYS, "tf_template_name,owner"),
            (TEMPLATE_NAME, "T"),
            ("owner", "ops"),
        ]));
        assert_eq!(config.user_entries(), map(&[("owner", "ops")]));
    }

    #[test]
    fn diskless_template_stores_nothing() {
        let mut config = OtherConfig::default();
        config.set_template_vbds(&[]);
        assert!(config.template_vbds().is_empty());
        assert!(config.as_map().is_empty());
    }
}
