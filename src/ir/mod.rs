//! The operation IR: an immutable, append-only DAG of build operations.
//!
//! [`OpNode`] is never mutated after construction; [`State`] is the
//! script-visible handle scripts actually manipulate. Every fluent method on
//! a `State` returns a brand new `State` referencing a brand new `OpNode`;
//! there is no in-place mutation anywhere in this module.

pub mod file_action;

use std::rc::Rc;

use indexmap::IndexMap;

use crate::mount::Mount;
use crate::platform::Platform;
use crate::source::SourceLocation;
pub use file_action::{ChownSpec, FileAction, UserRef};

/// An input edge: the producing node plus its output index.
pub type InputEdge = (Rc<OpNode>, u32);

/// Network isolation mode for an `Exec` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// No network access is granted beyond the solver's default.
    #[default]
    Unset,
    /// Full host networking.
    Host,
    /// No networking at all.
    None,
}

/// Security sandboxing mode for an `Exec` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// The default, fully sandboxed mode.
    #[default]
    Sandbox,
    /// Privileged/insecure mode.
    Insecure,
}

/// A named progress group, set via `with_metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressGroup {
    /// Stable identifier shared by every node in the group.
    pub id: String,
    /// Human-readable group name.
    pub name: String,
    /// Weak groups are collapsed in progress UIs that don't expand them.
    pub weak: bool,
}

/// Free-form per-node metadata: description annotations, an optional
/// progress group, the ignore-cache flag, and capability markers.
#[derive(Debug, Clone, Default)]
pub struct OpMeta {
    /// Human-authored description key/value pairs, in insertion order.
    pub description: IndexMap<String, String>,
    /// The progress group this node belongs to, if any.
    pub progress_group: Option<ProgressGroup>,
    /// If true, the solver must not serve this node from cache.
    pub ignore_cache: bool,
    /// Capability markers required to evaluate this node.
    pub caps: IndexMap<String, bool>,
}

/// A `Source` operation's identifier and attribute map.
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
    /// The source identifier, e.g. `docker-image://docker.io/library/alpine`.
    pub identifier: String,
    /// Source-specific attributes (patterns, checksums, headers, ...).
    pub attrs: IndexMap<String, String>,
}

/// An `Exec` operation's arguments.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// The command and its arguments.
    pub argv: Vec<String>,
    /// `KEY=VALUE` environment entries, in the order they should be applied.
    pub env: Vec<String>,
    /// Working directory; defaults to the image's own working directory.
    pub cwd: Option<String>,
    /// The user to run as.
    pub user: Option<String>,
    /// The container hostname.
    pub hostname: Option<String>,
    /// Mounts attached to this exec, in declaration order.
    pub mounts: Vec<Mount>,
    /// Network isolation mode.
    pub network: NetworkMode,
    /// Security sandboxing mode.
    pub security: SecurityMode,
    /// Exit codes that do not count as a failure. Empty means "only zero".
    pub valid_exit_codes: Vec<u8>,
}

/// The sum-typed operation an [`OpNode`] performs.
#[derive(Debug, Clone)]
pub enum Operation {
    /// A zero-input operation producing a filesystem from an external
    /// source (image, local context, git, http, or scratch).
    Source(SourceSpec),
    /// Runs a command against the filesystem produced by its first input.
    Exec(ExecSpec),
    /// Applies a single file-system action over its referenced inputs.
    File(FileAction),
    /// A layered union of two or more inputs, in order.
    Merge,
    /// The filesystem difference introduced by the second input (upper)
    /// over the first (lower).
    Diff,
}

/// An immutable node of the build DAG.
///
/// Constructed exactly once by an operation constructor in
/// [`crate::ops`], never mutated afterwards, and shared by value through
/// [`State`]'s `Rc`. Node identity for DAG bookkeeping (the serializer's
/// post-order visited-set) is pointer identity, not structural equality:
/// two independently constructed nodes with identical fields are distinct
/// vertices until the serializer digests them.
#[derive(Debug)]
pub struct OpNode {
    operation: Operation,
    inputs: Vec<InputEdge>,
    platform: Option<Platform>,
    meta: OpMeta,
    origin: SourceLocation,
}

impl OpNode {
    /// Construct a new, immutable node. Only [`crate::ops`] constructors
    /// call this directly; every other part of the crate only ever sees
    /// nodes wrapped in a [`State`].
    pub fn new(
        operation: Operation,
        inputs: Vec<InputEdge>,
        platform: Option<Platform>,
        meta: OpMeta,
        origin: SourceLocation,
    ) -> Rc<OpNode> {
        Rc::new(OpNode {
            operation,
            inputs,
            platform,
            meta,
            origin,
        })
    }

    /// The operation this node performs.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// The node's input edges, in construction order.
    pub fn inputs(&self) -> &[InputEdge] {
        &self.inputs
    }

    /// The node's own platform tag, if set.
    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    /// The node's metadata.
    pub fn meta(&self) -> &OpMeta {
        &self.meta
    }

    /// The call site that constructed this node.
    pub fn origin(&self) -> &SourceLocation {
        &self.origin
    }
}

/// A script-visible handle over an [`OpNode`], with value semantics: every
/// method returns a fresh `State` over a fresh node, and cloning a `State`
/// is an `Rc` bump, never a DAG copy.
#[derive(Debug, Clone)]
pub struct State {
    node: Rc<OpNode>,
    /// A platform override carried by the handle itself, independent of
    /// the underlying node's own `platform` field; set by
    /// [`State::with_platform`] and inherited by whichever node a
    /// subsequent fluent call constructs from this state.
    platform: Option<Platform>,
}

impl State {
    /// Wrap a freshly constructed node as a `State` with no platform
    /// override.
    pub fn new(node: Rc<OpNode>) -> Self {
        State {
            node,
            platform: None,
        }
    }

    /// The underlying node.
    pub fn node(&self) -> &Rc<OpNode> {
        &self.node
    }

    /// The effective platform for operations constructed from this state:
    /// the handle's override if set, otherwise the node's own tag.
    pub fn effective_platform(&self) -> Option<&Platform> {
        self.platform.as_ref().or_else(|| self.node.platform())
    }

    /// Return a new handle over the same node with a platform override.
    pub fn with_platform(&self, platform: Platform) -> State {
        State {
            node: Rc::clone(&self.node),
            platform: Some(platform),
        }
    }

    /// True if two handles reference the same underlying node.
    pub fn is_same_node(&self, other: &State) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
                file: "test.lua".into(),
                line: 1,
            },
        )
    }

    #[test]
    fn cloning_a_state_does_not_duplicate_the_node() {
        let s1 = State::new(leaf());
        let s2 = s1.clone();
        assert!(s1.is_same_node(&s2));
        assert_eq!(Rc::strong_count(s1.node()), 2); // s1 and s2 share one allocation
    }

    #[test]
    fn distinct_operations_yield_distinct_unrelated_nodes() {
        let base = State::new(leaf());
        let other = State::new(leaf());
        assert!(!base.is_same_node(&other));
    }

    #[test]
    fn with_platform_does_not_mutate_the_original() {
        let base = State::new(leaf());
        let overridden = base.with_platform(Platform::default_platform());
        assert!(base.effective_platform().is_none());
        assert!(overridden.effective_platform().is_some());
    }
}
