//! Typed mount attachments for `Exec` nodes.
//!
//! Mount constructors return opaque, free-standing values; they are only
//! consumed by [`crate::ops::run`]'s `mounts` option and validated at that
//! point. A [`Mount::Bind`] additionally carries a reference to a
//! [`crate::ir::State`], which becomes an extra input edge on the `Exec`
//! node it is attached to.

use crate::ir::State;

/// Sharing mode for a [`Mount::Cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheSharingMode {
    /// The mount can be used concurrently by multiple writers.
    #[default]
    Shared,
    /// A fresh mount is created if there are multiple concurrent writers.
    Private,
    /// A second concurrent writer waits for the first to release the mount.
    Locked,
}

/// A typed attachment for an `Exec` node.
#[derive(Debug, Clone)]
pub enum Mount {
    /// A persistent, namespaced cache directory.
    Cache {
        /// Mount point inside the exec's filesystem.
        dest: String,
        /// Cache namespace identifier.
        id: String,
        /// Concurrent-writer sharing policy.
        sharing: CacheSharingMode,
    },
    /// A secret value mounted as a file.
    Secret {
        /// Mount point inside the exec's filesystem.
        dest: String,
        /// Secret identifier used to query the value.
        id: String,
        /// Owning uid of the mounted file.
        uid: u32,
        /// Owning gid of the mounted file.
        gid: u32,
        /// Permission bits of the mounted file.
        mode: u32,
        /// If true, a missing secret is not an error.
        optional: bool,
    },
    /// An ssh-agent socket forward.
    Ssh {
        /// Mount point inside the exec's filesystem.
        dest: String,
        /// Identifier of the exposed ssh agent/key.
        id: String,
        /// Owning uid of the socket.
        uid: u32,
        /// Owning gid of the socket.
        gid: u32,
        /// Permission bits of the socket.
        mode: u32,
        /// If true, a missing ssh agent is not an error.
        optional: bool,
    },
    /// An ephemeral tmpfs.
    Tmpfs {
        /// Mount point inside the exec's filesystem.
        dest: String,
        /// Upper bound on the tmpfs size, in bytes.
        size_bytes: u64,
    },
    /// A bind mount of another operation's output.
    Bind {
        /// Mount point inside the exec's filesystem.
        dest: String,
        /// The state whose output is bound in.
        source: State,
        /// A sub-path within `source` to mount instead of its root.
        selector: Option<String>,
        /// Whether the mount is read-only.
        readonly: bool,
    },
}

impl Mount {
    /// Mount point inside the exec's filesystem, common to every variant.
    pub fn dest(&self) -> &str {
        match self {
            Mount::Cache { dest, .. }
            | Mount::Secret { dest, .. }
            | Mount::Ssh { dest, .. }
            | Mount::Tmpfs { dest, .. }
            | Mount::Bind { dest, .. } => dest,
        }
    }
}

/// `bk.cache(dest, id, opts?)`: a persistent cache mount. Sharing defaults
/// to [`CacheSharingMode::Shared`] when not overridden.
pub fn cache(dest: impl Into<String>, id: impl Into<String>, sharing: Option<CacheSharingMode>) -> Mount {
    Mount::Cache {
        dest: dest.into(),
        id: id.into(),
        sharing: sharing.unwrap_or_default(),
    }
}

/// `bk.secret(dest, opts?)`: a secret mount. Mode defaults to `0o400`.
pub fn secret(
    dest: impl Into<String>,
    id: impl Into<String>,
    uid: u32,
    gid: u32,
    mode: Option<u32>,
    optional: bool,
) -> Mount {
    Mount::Secret {
        dest: dest.into(),
        id: id.into(),
        uid,
        gid,
        mode: mode.unwrap_or(0o400),
        optional,
    }
}

/// `bk.ssh(opts?)`: an ssh-agent forward. Dest defaults to `/run/ssh`, mode
/// to `0o600`.
pub fn ssh(
    dest: Option<String>,
    id: impl Into<String>,
    uid: u32,
    gid: u32,
    mode: Option<u32>,
    optional: bool,
) -> Mount {
    Mount::Ssh {
        dest: dest.unwrap_or_else(|| "/run/ssh".to_string()),
        id: id.into(),
        uid,
        gid,
        mode: mode.unwrap_or(0o600),
        optional,
    }
}

/// `bk.tmpfs(dest, opts?)`: an ephemeral tmpfs.
pub fn tmpfs(dest: impl Into<String>, size_bytes: u64) -> Mount {
    Mount::Tmpfs {
        dest: dest.into(),
        size_bytes,
    }
}

/// `bk.bind(dest, source, opts?)`: a bind mount of another state's output.
/// Readonly defaults to `true`.
pub fn bind(dest: impl Into<String>, source: State, selector: Option<String>, readonly: Option<bool>) -> Mount {
    Mount::Bind {
        dest: dest.into(),
        source,
        selector,
        readonly: readonly.unwrap_or(true),
    }
}
