use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::errors::{ConfigError, ReferentialError};
use crate::profiles::profile::Profile;
use crate::profiles::ProfileHandle;

/// Per-workload profile store. Profiles are interned by name; redefinition is
/// an error. Reference counts are owned by the profiles themselves, the
/// registry only drops entries nobody references anymore.
pub struct ProfileRegistry {
    workload: String,
    profiles: FxHashMap<String, ProfileHandle>,
}

impl ProfileRegistry {
    pub fn new(workload: &str) -> Self {
        ProfileRegistry {
            workload: workload.to_string(),
            profiles: FxHashMap::default(),
        }
    }

    pub fn load_from_json(&mut self, doc: &Value, source: &str) -> Result<(), ConfigError> {
        let profiles = doc
            .get("profiles")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ConfigError::schema(format!("'{}': the 'profiles' object is missing", source))
            })?;
        for (name, description) in profiles {
            self.add(name, description.clone())?;
        }
        Ok(())
    }

    pub fn add(&mut self, name: &str, json: Value) -> Result<ProfileHandle, ConfigError> {
        if name.contains('!') {
            return Err(ConfigError::schema(format!(
                "profile name '{}' contains a '!'",
                name
            )));
        }
        if self.profiles.contains_key(name) {
            return Err(ConfigError::schema(format!(
                "profile '{}' already exists in workload '{}'",
                name, self.workload
            )));
        }
        let profile = Rc::new(Profile::new(&self.workload, name, json)?);
        self.profiles.insert(name.to_string(), profile.clone());
        Ok(profile)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<ProfileHandle, ReferentialError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ReferentialError::UnknownProfile {
                workload: self.workload.clone(),
                profile: name.to_string(),
            })
    }

    /// Hands out a handle and bumps the reference count.
    pub fn acquire(&self, name: &str) -> Result<ProfileHandle, ReferentialError> {
        let profile = self.get(name)?;
        profile.acquire();
        Ok(profile)
    }

    /// Drops one reference; the entry is removed once unreferenced.
    pub fn release(&mut self, name: &str) {
        if let Some(profile) = self.profiles.get(name) {
            profile.release();
            if profile.references() == 0 {
                self.profiles.remove(name);
            }
        }
    }

    pub fn remove_unreferenced(&mut self) {
        self.profiles.retain(|_, p| p.references() > 0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ProfileHandle)> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry_with_delay() -> ProfileRegistry {
        let mut registry = ProfileRegistry::new("w0");
        registry
            .add("d10", json!({"type": "delay", "delay": 10.0}))
            .unwrap();
        registry
    }

    #[test]
    fn interns_and_rejects_redefinition() {
        let mut registry = registry_with_delay();
        assert!(registry.exists("d10"));
        assert!(registry
            .add("d10", json!({"type": "delay", "delay": 3.0}))
            .is_err());
    }

    #[test]
    fn rejects_names_with_bang() {
        let mut registry = ProfileRegistry::new("w0");
        assert!(registry
            .add("a!b", json!({"type": "delay", "delay": 1.0}))
            .is_err());
    }

    #[test]
    fn drops_entries_on_last_release() {
        let mut registry = registry_with_delay();
        let handle = registry.acquire("d10").unwrap();
        handle.acquire();
        registry.release("d10");
        assert!(registry.exists("d10"));
        registry.release("d10");
        assert!(!registry.exists("d10"));
    }

    #[test]
    fn removes_unreferenced_profiles() {
        let mut registry = registry_with_delay();
        registry
            .add("unused", json!({"type": "delay", "delay": 1.0}))
            .unwrap();
        registry.acquire("d10").unwrap();
        registry.remove_unreferenced();
        assert!(registry.exists("d10"));
        assert!(!registry.exists("unused"));
    }
}
