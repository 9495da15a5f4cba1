//! The per-build interpreter.
//!
//! One `Interpreter` per build: it owns the `mlua::Lua` instance, the
//! single-assignment export slot, and the source registry, and wires the
//! sandbox, module loader and API bindings together. `Interpreter` is
//! deliberately `!Send`: `mlua::Lua` without the `send` feature already
//! enforces this, matching the single-threaded cooperative scheduling model.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::Lua;

use crate::error::{Error, Result};
use crate::export::ExportSlot;
use crate::image_config::ImageConfig;
use crate::ir::OpNode;
use crate::script::{bindings, loader, sandbox};
use crate::source::SourceRegistry;

pub use loader::SearchRoots;

/// The result of evaluating a build script.
#[derive(Debug)]
pub struct EvalResult {
    /// The exported root node, if `bk.export` was ever called.
    pub state: Option<Rc<OpNode>>,
    /// The exported image configuration, paired with `state`.
    pub image_config: Option<ImageConfig>,
    /// Every script/module source file read during evaluation, keyed by the
    /// resolved name under which it was registered.
    pub source_files: indexmap::IndexMap<String, Vec<u8>>,
}

/// A running interpreter instance, scoped to a single build.
#[derive(Debug)]
pub struct Interpreter {
    lua: Lua,
    export_slot: Rc<RefCell<ExportSlot>>,
    registry: Rc<RefCell<SourceRegistry>>,
}

impl Interpreter {
    /// Construct a fresh interpreter: applies the sandbox, installs
    /// `require` over `options`'s search roots, and installs the `bk` API.
    pub fn new(options: &super::ScriptOptions) -> Result<Self> {
        let lua = Lua::new();
        sandbox::apply(&lua)?;

        let export_slot = Rc::new(RefCell::new(ExportSlot::new()));
        let registry = Rc::new(RefCell::new(SourceRegistry::new()));
        let cache = Rc::new(RefCell::new(std::collections::HashMap::new()));

        loader::install(&lua, options.search_roots.clone(), Rc::clone(&registry), cache)?;
        bindings::install(&lua, Rc::clone(&export_slot))?;

        for (key, value) in &options.options {
            lua.globals().set(key.as_str(), value.as_str())?;
        }

        log::debug!(
            "interpreter ready: context_dir={:?} stdlib_dir={:?}",
            options.search_roots.context_dir,
            options.search_roots.stdlib_dir
        );

        Ok(Interpreter { lua, export_slot, registry })
    }

    /// Evaluate `entry_source`, named `entry_name` in error messages and the
    /// source registry, and collect the result.
    ///
    /// A script that never calls `bk.export` is not itself an error: the
    /// returned `EvalResult.state` is simply `None`. Deciding whether that
    /// is fatal is left to the caller.
    pub fn eval(&self, entry_source: &[u8], entry_name: &str) -> Result<EvalResult> {
        self.registry.borrow_mut().register(entry_name, entry_source.to_vec());
        log::debug!("evaluating {entry_name} ({} bytes)", entry_source.len());

        self.lua
            .load(entry_source)
            .set_name(entry_name)
            .exec()
            .map_err(Error::Lua)?;

        let (state, image_config) = match self.export_slot.borrow().get() {
            Some((root, cfg)) => (Some(Rc::clone(root)), Some(cfg.clone())),
            None => {
                log::warn!("{entry_name} completed without calling bk.export");
                (None, None)
            }
        };

        let source_files = self
            .registry
            .borrow()
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
            .collect();

        Ok(EvalResult { state, image_config, source_files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::ScriptOptions;

    #[test]
    fn eval_without_export_reports_none() {
        let _ = env_logger::try_init();
        let interp = Interpreter::new(&ScriptOptions::builder().build()).unwrap();
        let result = interp.eval(b"local x = 1", "build.lua").unwrap();
        assert!(result.state.is_none());
        assert!(result.image_config.is_none());
    }

    #[test]
    fn eval_records_entry_source_in_registry() {
        let interp = Interpreter::new(&ScriptOptions::builder().build()).unwrap();
        let result = interp.eval(b"bk.export(bk.scratch())", "build.lua").unwrap();
        assert!(result.state.is_some());
        assert_eq!(result.source_files.get("build.lua").map(Vec::as_slice), Some(&b"bk.export(bk.scratch())"[..]));
    }

    #[test]
    fn sandbox_is_active_inside_eval() {
        let interp = Interpreter::new(&ScriptOptions::builder().build()).unwrap();
        let err = interp.eval(b"os.execute('echo hi')", "build.lua").unwrap_err();
        assert!(err.to_string().contains("disabled in the build script sandbox"));
    }

    #[test]
    fn lua_runtime_errors_propagate_as_lua_variant() {
        let interp = Interpreter::new(&ScriptOptions::builder().build()).unwrap();
        let err = interp.eval(b"error('boom')", "build.lua").unwrap_err();
        assert!(matches!(err, Error::Lua(_)));
    }
}
