//! ABOUTME: Per-context side table mapping opaque engine_ref ids to mlua registry keys
//! ABOUTME: Backs ScriptValue::Function/UserData via mlua's own registry, never a raw GC pointer (§9 weak references)

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

enum Slot {
    Function(mlua::RegistryKey),
    UserData(mlua::RegistryKey),
}

/// Maps an opaque `engine_ref` to an `mlua::RegistryKey` holding the actual
/// function/userdata value in the Lua registry. Using the registry (rather
/// than holding an `mlua::Function<'lua>` directly) sidesteps the `'lua`
/// borrow entirely: a `RegistryKey` is `'static` and is only ever
/// dereferenced back through the same `mlua::Lua` instance that created it.
#[derive(Default)]
pub struct LuaHandleRegistry {
    next_ref: AtomicU64,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl LuaHandleRegistry {
    pub fn register_function(&self, lua: &mlua::Lua, f: mlua::Function<'_>) -> Result<u64, mlua::Error> {
        let key = lua.create_registry_value(f)?;
        let id = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(id, Slot::Function(key));
        Ok(id)
    }

    pub fn register_userdata(&self, lua: &mlua::Lua, ud: mlua::AnyUserData<'_>) -> Result<u64, mlua::Error> {
        let key = lua.create_registry_value(ud)?;
        let id = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.slots.lock().insert(id, Slot::UserData(key));
        Ok(id)
    }

    pub fn resolve_function<'lua>(&self, lua: &'lua mlua::Lua, engine_ref: u64) -> Option<mlua::Function<'lua>> {
        let slots = self.slots.lock();
        match slots.get(&engine_ref)? {
            Slot::Function(key) => lua.registry_value(key).ok(),
            Slot::UserData(_) => None,
        }
    }

    pub fn resolve_userdata<'lua>(&self, lua: &'lua mlua::Lua, engine_ref: u64) -> Option<mlua::AnyUserData<'lua>> {
        let slots = self.slots.lock();
        match slots.get(&engine_ref)? {
            Slot::UserData(key) => lua.registry_value(key).ok(),
            Slot::Function(_) => None,
        }
    }

    /// Drops every registry key so the Lua GC can reclaim the underlying
    /// values. Must be called before the owning `mlua::Lua` is dropped.
    pub fn clear(&self, lua: &mlua::Lua) {
        for (_, slot) in self.slots.lock().drain() {
            match slot {
                Slot::Function(key) | Slot::UserData(key) => {
                    let _ = lua.remove_registry_value(key);
                }
            }
        }
    }
}
