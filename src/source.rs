//! The source-file registry and call-site location records.
//!
//! Every script and module loaded during a build is registered here by
//! filename; the canonical serializer consumes the registry to assemble the
//! wire format's source map (`source.infos` / `source.filenames`).

use indexmap::IndexMap;

/// The (file, line) of the script frame that constructed an `OpNode`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    /// The script-visible file name, as reported by the interpreter's debug
    /// info (e.g. `build.lua`, not an absolute filesystem path).
    pub file: String,
    /// The 1-based line number of the call site.
    pub line: u32,
}

/// Registry mapping script file name to its original bytes.
///
/// Scoped to a single [`crate::script::host::Interpreter`] so that
/// concurrent builds on distinct interpreters never share state; reset by
/// constructing a new registry at the start of each evaluation.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    files: IndexMap<String, Vec<u8>>,
}

impl SourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file's bytes under `name`, unless already present.
    ///
    /// Re-registering the same name is a no-op: the entry (and its
    /// insertion-order position) is left untouched. This keeps `require`
    /// idempotent across repeated calls for the same module.
    pub fn register(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.entry(name.into()).or_insert_with(|| bytes.into());
    }

    /// Look up a previously registered file's bytes.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    /// True if `name` has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    /// Iterate the registered files in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// The number of registered files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if no files have been registered.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent_and_ordered() {
        let mut reg = SourceRegistry::new();
        reg.register("a.lua", b"a".to_vec());
        reg.register("b.lua", b"b".to_vec());
        reg.register("a.lua", b"different".to_vec());
        let names: Vec<&str> = reg.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a.lua", "b.lua"]);
        assert_eq!(reg.get("a.lua"), Some(&b"a"[..]));
    }
}
