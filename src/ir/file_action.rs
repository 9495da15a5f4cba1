//! [`FileAction`]: the single action carried by a `File` [`super::Operation`].

/// A numeric or named user/group reference used by [`ChownSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    /// A literal user or group name, e.g. `"www-data"`.
    Name(String),
    /// A numeric uid or gid.
    Id(u32),
}

/// An optional ownership override for `Copy`, `Mkdir` and `Mkfile`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChownSpec {
    /// The owning user, if overridden.
    pub user: Option<UserRef>,
    /// The owning group, if overridden.
    pub group: Option<UserRef>,
}

/// The single file-system action a `File` [`super::Operation`] performs.
///
/// Every `copy`/`mkdir`/`mkfile`/`rm`/`symlink` call in the scripted API
/// produces exactly one `FileAction` on a freshly constructed node. The
/// `File` operation describes a list purely for wire-format parity with
/// upstream LLB `FileOp`, which this frontend never exercises beyond length
/// one.
#[derive(Debug, Clone, PartialEq)]
pub enum FileAction {
    /// Copy a path from a secondary input on top of the base input.
    Copy {
        /// Index into the node's `inputs` identifying the content source.
        /// Equal to the base input's index (`0`) when copying from within
        /// the same filesystem.
        src_input_index: u32,
        /// The path to read within the source input.
        source_path: String,
        /// The path to write within the base input.
        dest_path: String,
        /// Permission bits override; `None` preserves the source mode.
        mode: Option<u32>,
        /// Resolve symlinks in `source_path` before copying.
        follow_symlink: bool,
        /// Create intermediate directories for `dest_path` if missing.
        create_dest_path: bool,
        /// Allow glob wildcards in `source_path`.
        allow_wildcard: bool,
        /// Only copy paths matching at least one of these patterns.
        include: Vec<String>,
        /// Exclude paths matching any of these patterns.
        exclude: Vec<String>,
        /// Ownership override for the copied paths.
        owner: Option<ChownSpec>,
    },
    /// Create a new directory.
    Mkdir {
        /// The directory path to create.
        path: String,
        /// Permission bits.
        mode: u32,
        /// Create parent directories as needed.
        make_parents: bool,
        /// Ownership override for the new directory.
        owner: Option<ChownSpec>,
    },
    /// Create a new file with literal contents.
    Mkfile {
        /// The file path to create.
        path: String,
        /// The file's byte contents.
        data: Vec<u8>,
        /// Permission bits.
        mode: u32,
        /// Ownership override for the new file.
        owner: Option<ChownSpec>,
    },
    /// Remove a path.
    Rm {
        /// The path to remove.
        path: String,
        /// Do not fail if the path does not exist.
        allow_not_found: bool,
        /// Allow glob wildcards in `path`.
        allow_wildcard: bool,
    },
    /// Create a symbolic link.
    Symlink {
        /// The link target.
        oldpath: String,
        /// The link path to create.
        newpath: String,
    },
}
