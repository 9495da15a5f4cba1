//! The crate's single top-level entry point and its configuration surface.
//!
//! `ScriptOptions` / `ScriptOptionsBuilder` follow the usual fluent builder
//! pattern: a plain data struct, a separate builder wrapping it, chained
//! setters consuming and returning `Self`, and a final `build(self)` that
//! hands back the plain struct.

use indexmap::IndexMap;

use crate::error::Result;
pub use crate::script::host::{EvalResult, Interpreter, SearchRoots};

/// Host-visible configuration for a single script evaluation.
///
/// ## Examples
///
/// ```rust
/// use llbscript::eval::ScriptOptions;
///
/// ScriptOptions::builder().option("VERSION", "1.2.3").build();
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOptions {
    pub(crate) search_roots: SearchRoots,
    pub(crate) options: IndexMap<String, String>,
}

impl ScriptOptions {
    /// Construct a builder for `ScriptOptions`.
    pub fn builder() -> ScriptOptionsBuilder {
        ScriptOptionsBuilder::new()
    }
}

/// Builder for [`ScriptOptions`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOptionsBuilder {
    inner: ScriptOptions,
}

impl ScriptOptionsBuilder {
    /// Construct a new builder with no search roots and an empty options
    /// map.
    pub fn new() -> Self {
        Self::default()
    }

    /// The build-context directory, checked first by `require`.
    pub fn context_dir(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.inner.search_roots.context_dir = Some(path.into());
        self
    }

    /// The standard-library directory, checked second by `require`.
    pub fn stdlib_dir(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.inner.search_roots.stdlib_dir = Some(path.into());
        self
    }

    /// Append a `string -> string` entry exposed to the script as a global
    /// variable of the same name.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.options.insert(key.into(), value.into());
        self
    }

    /// Finalize the builder.
    pub fn build(self) -> ScriptOptions {
        self.inner
    }
}

/// Evaluate `script`, named `entry_name`, under `options`.
///
/// This is the crate's single top-level entry point: construct an
/// [`Interpreter`], run the script once, and return its [`EvalResult`]. A
/// script that never calls `bk.export` is not an error here; see
/// `EvalResult::state`.
pub fn evaluate(script: &[u8], entry_name: &str, options: ScriptOptions) -> Result<EvalResult> {
    let interpreter = Interpreter::new(&options)?;
    interpreter.eval(script, entry_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_options_map() {
        let opts = ScriptOptions::builder().option("VERSION", "1.2.3").build();
        assert_eq!(opts.options.get("VERSION"), Some(&"1.2.3".to_string()));
    }

    #[test]
    fn option_map_entries_are_visible_as_globals() {
        let opts = ScriptOptions::builder().option("VERSION", "1.2.3").build();
        let result = evaluate(b"bk.export(bk.scratch(), {workdir = VERSION})", "build.lua", opts).unwrap();
        assert_eq!(result.image_config.unwrap().workdir, Some("1.2.3".to_string()));
    }

    #[test]
    fn evaluate_surfaces_lua_syntax_errors() {
        let err = evaluate(b"this is not lua (", "build.lua", ScriptOptions::default()).unwrap_err();
        assert!(matches!(err, crate::error::Error::Lua(_)));
    }
}
