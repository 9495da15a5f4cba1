//! Call-site capture: the `(file, line)` of the Lua frame that invoked the
//! currently executing binding function.
//!
//! Every constructor exposed to scripts calls [`capture`] before building
//! its `OpNode` so the node's `origin` reflects where the *script* called
//! `bk.image(...)` (or similar), not where the Rust binding itself lives.

use mlua::Lua;

use crate::source::SourceLocation;

/// Capture the call site one frame up from the Rust function currently
/// running as a Lua callback.
///
/// Falls back to `("?", 0)` if the interpreter has no frame at that level
/// (this should not happen for a function called directly from script, but
/// a placeholder location is preferable to a panic here).
pub fn capture(lua: &Lua) -> SourceLocation {
    lua.inspect_stack(1, |debug| {
        let source = debug.source();
        let file = source
            .short_src
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".to_string());
        let line = debug.curr_line();
        SourceLocation {
            file,
            line: line.max(0) as u32,
        }
    })
    .unwrap_or(SourceLocation {
        file: "?".to_string(),
        line: 0,
    })
}
