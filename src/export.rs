//! The single-assignment export slot.
//!
//! `Unset -> Set -> (frozen)`. A per-interpreter value, never process-global,
//! so that distinct interpreters can evaluate concurrently without
//! colliding.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::image_config::ImageConfig;
use crate::ir::OpNode;

/// The process-of-record for a build's single `bk.export` call.
#[derive(Debug, Default)]
pub struct ExportSlot {
    value: Option<(Rc<OpNode>, ImageConfig)>,
}

impl ExportSlot {
    /// A fresh, unset slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `set` has succeeded.
    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// `bk.export(state, opts)`. Fails with the fixed message
    /// `already called once` on the second call.
    pub fn set(&mut self, root: Rc<OpNode>, image_config: ImageConfig) -> Result<()> {
        if self.value.is_some() {
            return Err(Error::ExportAlreadyCalled);
        }
        self.value = Some((root, image_config));
        Ok(())
    }

    /// Read the exported `(root, image_config)` pair, if any.
    pub fn get(&self) -> Option<&(Rc<OpNode>, ImageConfig)> {
        self.value.as_ref()
    }

    /// Consume the slot, returning `(root, image_config)` if it was ever
    /// set. Reading an unset slot is not itself an error here: the core
    /// reports this as `None` and leaves presentation to the caller.
    pub fn into_inner(self) -> Option<(Rc<OpNode>, ImageConfig)> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{OpMeta, Operation, SourceSpec};
    use crate::source::SourceLocation;
    use indexmap::IndexMap;

    fn leaf() -> Rc<OpNode> {
        OpNode::new(
            Operation::Source(SourceSpec {
                identifier: String::new(),
                attrs: IndexMap::new(),
            }),
            Vec::new(),
            None,
            OpMeta::default(),
            SourceLocation {
                file: "t.lua".into(),
                line: 1,
            },
        )
    }

    #[test]
    fn second_set_fails_with_fixed_message() {
        let mut slot = ExportSlot::new();
        slot.set(leaf(), ImageConfig::default()).unwrap();
        let err = slot.set(leaf(), ImageConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "already called once");
    }

    #[test]
    fn unset_slot_reports_none() {
        let slot = ExportSlot::new();
        assert!(slot.get().is_none());
        assert!(!slot.is_set());
    }
}
