#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
//! # llbscript: a sandboxed Lua frontend for buildkit LLB graphs
//!
//! `llbscript` embeds a sandboxed Lua interpreter and exposes a small,
//! closed API (the global `bk` table) for describing a container build as a
//! DAG of filesystem operations. Evaluating a script produces an
//! [`eval::EvalResult`] carrying the exported root node and image
//! configuration; [`serialize::to_definition`] turns that into the
//! canonical, content-addressed buildkit `Definition` protobuf a solver
//! consumes.
//!
//! ```text
//! script text ──▶ [Interpreter + API bindings] ──▶ DAG of OpNodes ──▶ [Canonical Serializer] ──▶ {Definition blob, ImageConfig, SourceMap}
//! ```
//!
//! This crate has no network or filesystem surface of its own beyond the
//! script's own configured source roots (`ScriptOptions::context_dir`/
//! `stdlib_dir`); handing the serialized graph to a solver is left to the
//! caller.
//!
//! # Usage
//!
//! ```rust
//! use llbscript::eval::{evaluate, ScriptOptions};
//! use llbscript::serialize::from_eval;
//!
//! let script = br#"
//!     local base = bk.image("alpine:3.19")
//!     local built = base:run("echo hello")
//!     bk.export(built, { cmd = {"/bin/sh"} })
//! "#;
//!
//! let result = evaluate(script, "build.lua", ScriptOptions::builder().build()).unwrap();
//! let definition = from_eval(&result).unwrap();
//! assert!(!definition.def.is_empty());
//! ```

pub mod error;
pub mod eval;
pub mod export;
pub mod image_config;
pub mod ir;
pub mod mount;
pub mod ops;
pub mod pb;
pub mod platform;
pub mod script;
pub mod serialize;
pub mod source;

pub use error::{Error, Result};
pub use eval::{evaluate, ScriptOptions, ScriptOptionsBuilder};
