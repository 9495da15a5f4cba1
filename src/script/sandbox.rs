//! Capability neutralization for the embedded Lua sandbox.
//!
//! The host removes or neutralizes everything that could touch the host
//! filesystem, process, or environment: `io`, `os.execute`/`exit`/
//! `remove`/`rename`/`tmpname`/`getenv`, `dofile`, `loadfile`, and `debug`.
//! Neutralized names are rebound to a non-callable, non-`nil` sentinel
//! rather than removed outright: a script that
//! defensively checks `type(os.execute) == "function"` correctly concludes
//! the capability is unavailable, while `if os then ... end`-style presence
//! checks still see a real (if inert) value, and the first *use* of a
//! disabled capability fails with a clear message instead of a generic
//! "attempt to call a nil value".
//!
//! `os.time`, `os.clock`, `os.date` and `os.difftime` are left alone: they
//! are pure and carry no ambient authority over the host.

use mlua::{Lua, MetaMethod, MultiValue, Result as LuaResult, UserData, UserDataMethods, Value};

/// A neutralized capability: calling it raises a descriptive error;
/// indexing into it (e.g. `io.open`) yields another sentinel for the same
/// named capability, so `io.open("x"):read()`-style chains still fail at
/// the first call rather than with a confusing index error.
#[derive(Debug, Clone)]
struct Neutralized(String);

impl UserData for Neutralized {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Call, |_, this, _: MultiValue| -> LuaResult<Value> {
            Err(mlua::Error::RuntimeError(format!(
                "'{}' is disabled in the build script sandbox",
                this.0
            )))
        });
        methods.add_meta_method(MetaMethod::Index, |_, this, _: Value| -> LuaResult<Neutralized> {
            Ok(Neutralized(this.0.clone()))
        });
    }
}

const NEUTRALIZED_OS_FIELDS: &[&str] = &["execute", "exit", "remove", "rename", "tmpname", "getenv"];

/// Apply the sandbox to `lua`'s globals.
pub fn apply(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();

    globals.set("dofile", Neutralized("dofile".to_string()))?;
    globals.set("loadfile", Neutralized("loadfile".to_string()))?;
    globals.set("debug", Neutralized("debug".to_string()))?;
    globals.set("io", Neutralized("io".to_string()))?;

    if let Ok(os) = globals.get::<mlua::Table>("os") {
        for field in NEUTRALIZED_OS_FIELDS {
            os.set(*field, Neutralized(format!("os.{field}")))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutralized_capability_is_truthy_but_fails_on_call() {
        let lua = Lua::new();
        apply(&lua).unwrap();
        let truthy: bool = lua.load("return io ~= nil").eval().unwrap();
        assert!(truthy);
        let err = lua.load("return io.open('/etc/passwd')").exec().unwrap_err();
        assert!(err.to_string().contains("disabled in the build script sandbox"));
    }

    #[test]
    fn os_time_survives_sandboxing() {
        let lua = Lua::new();
        apply(&lua).unwrap();
        let ok: bool = lua.load("return type(os.time) == 'function'").eval().unwrap();
        assert!(ok);
    }

    #[test]
    fn os_execute_is_neutralized() {
        let lua = Lua::new();
        apply(&lua).unwrap();
        let is_fn: bool = lua.load("return type(os.execute) == 'function'").eval().unwrap();
        assert!(!is_fn);
        let err = lua.load("os.execute('echo hi')").exec().unwrap_err();
        assert!(err.to_string().contains("os.execute"));
    }
}
