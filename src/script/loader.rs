//! The `require(name)` module loader.
//!
//! Two configurable search roots, checked in order: the build-context
//! directory (user sources colocated with the entry script) first, then the
//! host-provided standard-library directory. Within each root, `<root>/
//! <name>`, `<root>/<name>.lua` and `<root>/<name>/init.lua` are tried in
//! that order; the first match wins. Loaded module source is registered
//! into the [`SourceRegistry`] under its resolved path and the compiled
//! module result is cached per interpreter, mirroring (but not sharing
//! state with) Lua's own `package.loaded`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::{Lua, RegistryKey, Value};

use crate::error::Error;
use crate::source::SourceRegistry;

/// The two configurable search roots `require` consults, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRoots {
    /// User sources colocated with the entry script. Checked first, so a
    /// build-context module of the same name overrides the standard
    /// library.
    pub context_dir: Option<PathBuf>,
    /// Host-provided shared modules.
    pub stdlib_dir: Option<PathBuf>,
}

fn candidates(root: &Path, name: &str) -> [PathBuf; 3] {
    [
        root.join(name),
        root.join(format!("{name}.lua")),
        root.join(name).join("init.lua"),
    ]
}

fn resolve(roots: &SearchRoots, name: &str) -> Option<PathBuf> {
    [roots.context_dir.as_ref(), roots.stdlib_dir.as_ref()]
        .into_iter()
        .flatten()
        .flat_map(|root| candidates(root, name))
        .find(|candidate| candidate.is_file())
}

/// Per-interpreter cache of already-loaded modules, keyed by the name
/// passed to `require`.
pub type ModuleCache = Rc<RefCell<HashMap<String, RegistryKey>>>;

/// Install a sandboxed `require` global on `lua` that resolves modules
/// against `roots`, records their source in `registry`, and caches results
/// in `cache`.
pub fn install(lua: &Lua, roots: SearchRoots, registry: Rc<RefCell<SourceRegistry>>, cache: ModuleCache) -> mlua::Result<()> {
    let func = lua.create_function(move |lua, name: String| -> mlua::Result<Value> {
        if let Some(key) = cache.borrow().get(&name) {
            return lua.registry_value(key);
        }

        let path = resolve(&roots, &name).ok_or_else(|| {
            mlua::Error::external(Error::ModuleNotFound { name: name.clone() })
        })?;
        let bytes = std::fs::read(&path).map_err(|e| {
            mlua::Error::external(Error::ModuleLoad {
                name: name.clone(),
                source: Box::new(Error::validation(format!("reading {}: {e}", path.display()))),
            })
        })?;

        let display_name = path.to_string_lossy().into_owned();
        log::debug!("require('{name}') resolved to {display_name}");
        registry.borrow_mut().register(display_name.clone(), bytes.clone());

        let value: Value = lua
            .load(&bytes)
            .set_name(&display_name)
            .call(())
            .map_err(|e| {
                mlua::Error::external(Error::ModuleLoad {
                    name: name.clone(),
                    source: Box::new(Error::Lua(e)),
                })
            })?;
        // A module that returns nothing caches as `true`, matching stock
        // Lua's own `require` default for modules without an explicit
        // `return`.
        let value = if matches!(value, Value::Nil) { Value::Boolean(true) } else { value };

        let key = lua.create_registry_value(value.clone())?;
        cache.borrow_mut().insert(name, key);
        Ok(value)
    })?;
    lua.globals().set("require", func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_module(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn resolves_plain_name_then_dot_lua_then_init() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "helpers.lua", "return {tag = 'helpers'}");
        let roots = SearchRoots {
            context_dir: Some(dir.path().to_path_buf()),
            stdlib_dir: None,
        };
        assert_eq!(resolve(&roots, "helpers"), Some(dir.path().join("helpers.lua")));
    }

    #[test]
    fn context_dir_overrides_stdlib_dir() {
        let ctx = tempfile::tempdir().unwrap();
        let stdlib = tempfile::tempdir().unwrap();
        write_module(ctx.path(), "shared.lua", "return 'context'");
        write_module(stdlib.path(), "shared.lua", "return 'stdlib'");
        let roots = SearchRoots {
            context_dir: Some(ctx.path().to_path_buf()),
            stdlib_dir: Some(stdlib.path().to_path_buf()),
        };
        assert_eq!(resolve(&roots, "shared"), Some(ctx.path().join("shared.lua")));
    }

    #[test]
    fn require_caches_and_registers_source() {
        let lua = Lua::new();
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "mod.lua", "return {n = 1}");
        let registry = Rc::new(RefCell::new(SourceRegistry::new()));
        let cache: ModuleCache = Rc::new(RefCell::new(HashMap::new()));
        install(
            &lua,
            SearchRoots {
                context_dir: Some(dir.path().to_path_buf()),
                stdlib_dir: None,
            },
            Rc::clone(&registry),
            cache,
        )
        .unwrap();

        let n: i64 = lua.load("return require('mod').n").eval().unwrap();
        assert_eq!(n, 1);
        assert_eq!(registry.borrow().len(), 1);
    }

    #[test]
    fn missing_module_reports_not_found() {
        let lua = Lua::new();
        let registry = Rc::new(RefCell::new(SourceRegistry::new()));
        let cache: ModuleCache = Rc::new(RefCell::new(HashMap::new()));
        install(&lua, SearchRoots::default(), registry, cache).unwrap();
        let err = lua.load("return require('nope')").exec().unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
