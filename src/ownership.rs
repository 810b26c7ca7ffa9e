use mlua::RegistryKey;

/// Who holds the authority to finalize a bridged object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Created natively, or handed over by the script finalizer. Script
    /// proxies of native-owned objects never destroy on collection.
    Native,
    /// At least one owning proxy is live in script. Each one's finalizer
    /// releases the reference it was handed, exactly once.
    Script,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Count reached zero; the caller must run cleanup and free the slot.
    Freed,
    /// Other owners remain; memory stays allocated.
    Deferred,
}

/// Shared native/script lifetime state carried by every entity and component.
///
/// The count covers every owner (creator, registry, component array, each
/// script owning proxy). The single registry slot caches the non-owning proxy
/// pushed to script so repeated pushes reuse one userdata.
pub struct Bridge {
    ref_count: u32,
    script_owners: u32,
    handle: Option<RegistryKey>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("ref_count", &self.ref_count)
            .field("script_owners", &self.script_owners)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

impl Bridge {
    pub fn native() -> Self {
        Self {
            ref_count: 1,
            script_owners: 0,
            handle: None,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn ownership(&self) -> Ownership {
        if self.script_owners > 0 {
            Ownership::Script
        } else {
            Ownership::Native
        }
    }

    pub fn retain(&mut self) -> u32 {
        self.ref_count = self
            .ref_count
            .checked_add(1)
            .unwrap_or_else(|| panic!("bridge reference count overflow"));
        self.ref_count
    }

    /// Drops one reference. Panics on underflow: releasing an object nobody
    /// owns means some owner released twice.
    pub fn unref(&mut self) -> u32 {
        assert!(
            self.ref_count > 0,
            "bridge reference count underflow (released more times than retained)"
        );
        self.ref_count -= 1;
        self.ref_count
    }

    pub fn destroy(&mut self) -> Release {
        if self.unref() == 0 {
            Release::Freed
        } else {
            Release::Deferred
        }
    }

    /// Turns one reference the caller already holds into an owning proxy's
    /// reference.
    pub fn hand_to_script(&mut self) {
        assert!(
            self.script_owners < self.ref_count,
            "handing an unowned reference to script"
        );
        self.script_owners += 1;
    }

    /// Script finalizer path. Only a still-script-owned object gives up a
    /// reference here; once the last owning proxy is gone native code holds
    /// sole authority.
    pub fn finalize(&mut self) -> Option<Release> {
        if self.script_owners == 0 {
            return None;
        }
        self.script_owners -= 1;
        Some(self.destroy())
    }

    pub fn handle(&self) -> Option<&RegistryKey> {
        self.handle.as_ref()
    }

    pub fn set_handle(&mut self, key: RegistryKey) -> Option<RegistryKey> {
        self.handle.replace(key)
    }

    pub fn take_handle(&mut self) -> Option<RegistryKey> {
        self.handle.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_ref_unref_restores_count() {
        let mut bridge = Bridge::native();
        let start = bridge.ref_count();
        for _ in 0..5 {
            bridge.retain();
        }
        for _ in 0..5 {
            bridge.unref();
        }
        assert_eq!(bridge.ref_count(), start);
    }

    #[test]
    fn destroy_with_outstanding_refs_defers() {
        let mut bridge = Bridge::native();
        bridge.retain();
        assert_eq!(bridge.destroy(), Release::Deferred);
        assert_eq!(bridge.ref_count(), 1);
        assert_eq!(bridge.destroy(), Release::Freed);
    }

    #[test]
    fn finalize_only_releases_script_owned_once() {
        let mut bridge = Bridge::native();
        bridge.retain();
        assert_eq!(bridge.finalize(), None);

        bridge.hand_to_script();
        assert_eq!(bridge.finalize(), Some(Release::Deferred));
        assert_eq!(bridge.ownership(), Ownership::Native);
        assert_eq!(bridge.finalize(), None);
        assert_eq!(bridge.ref_count(), 1);
    }

    #[test]
    fn each_owning_proxy_releases_its_own_reference() {
        let mut bridge = Bridge::native();
        bridge.hand_to_script();
        bridge.retain();
        bridge.hand_to_script();
        assert_eq!(bridge.ref_count(), 2);

        assert_eq!(bridge.finalize(), Some(Release::Deferred));
        assert_eq!(bridge.ownership(), Ownership::Script);
        assert_eq!(bridge.finalize(), Some(Release::Freed));
        assert_eq!(bridge.ownership(), Ownership::Native);
        assert_eq!(bridge.finalize(), None);
    }

    #[test]
    fn handle_slot_holds_one_registry_key() {
        let lua = mlua::Lua::new();
        let mut bridge = Bridge::native();
        assert!(bridge.handle().is_none());
        let first = lua.create_registry_value("first").expect("registry");
        let second = lua.create_registry_value("second").expect("registry");
        assert!(bridge.set_handle(first).is_none());
        let replaced = bridge.set_handle(second).expect("previous handle");
        assert_eq!(lua.registry_value::<String>(&replaced).expect("value"), "first");
        let taken = bridge.take_handle().expect("handle");
        assert_eq!(lua.registry_value::<String>(&taken).expect("value"), "second");
        assert!(bridge.handle().is_none());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn unref_below_zero_is_fatal() {
        let mut bridge = Bridge::native();
        bridge.unref();
        bridge.unref();
    }
}
