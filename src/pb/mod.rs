//! Vendored LLB wire types.
//!
//! Generated once from upstream BuildKit's `solver/pb/ops.proto` and
//! checked in verbatim; there is no build-time codegen step here.

#[allow(clippy::all)]
pub mod pb {
    include!("generated/pb.rs");
}

pub use pb::*;
