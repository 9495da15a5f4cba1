//! Typed operation constructors.
//!
//! Every function here validates its arguments, normalizes defaults, and
//! returns a freshly constructed [`State`]. This is the operation-
//! construction API itself; [`crate::script::bindings`] is a thin layer
//! that type-checks Lua arguments and forwards to these functions, so that
//! the validation rules below apply identically regardless of caller.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::ir::{ExecSpec, FileAction, NetworkMode, OpMeta, OpNode, Operation, ProgressGroup, SecurityMode, SourceSpec, State};
use crate::mount::Mount;
use crate::platform::Platform;
use crate::source::SourceLocation;

/// A `mode` argument as accepted from script: either a pre-parsed base-8
/// string or a literal number used as-is.
#[derive(Debug, Clone)]
pub enum ModeValue {
    /// Parsed as base-8, e.g. `"0755"` -> `0o755`.
    Str(String),
    /// Used as-is, whatever base the host language happened to parse the
    /// literal in (typically base-10 for a bare numeric literal).
    Num(i64),
}

/// Resolve a [`ModeValue`] to its final numeric mode.
pub fn parse_mode(value: &ModeValue) -> Result<u32> {
    match value {
        ModeValue::Str(s) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
            .map_err(|_| Error::validation(format!("invalid octal mode string '{s}'"))),
        ModeValue::Num(n) => u32::try_from(*n).map_err(|_| Error::validation(format!("mode out of range: {n}"))),
    }
}

/// A `valid_exit_codes` argument: a single code, a list, or a `"lo..hi"`
/// range string.
#[derive(Debug, Clone)]
pub enum ExitCodes {
    /// A single exit code.
    Single(i64),
    /// An explicit list of exit codes.
    List(Vec<i64>),
    /// A `"lo..hi"` inclusive range, `0 <= lo <= hi <= 255`.
    Range(String),
}

/// Expand an [`ExitCodes`] value into the concrete, validated list.
pub fn parse_exit_codes(codes: &ExitCodes) -> Result<Vec<u8>> {
    fn to_u8(n: i64) -> Result<u8> {
        u8::try_from(n).map_err(|_| Error::validation(format!("exit code out of range: {n}")))
    }
    match codes {
        ExitCodes::Single(n) => Ok(vec![to_u8(*n)?]),
        ExitCodes::List(list) => list.iter().copied().map(to_u8).collect(),
        ExitCodes::Range(s) => {
            let (lo, hi) = s
                .split_once("..")
                .ok_or_else(|| Error::validation(format!("invalid exit code range '{s}'")))?;
            let lo: u16 = lo
                .parse()
                .map_err(|_| Error::validation(format!("invalid exit code range '{s}'")))?;
            let hi: u16 = hi
                .parse()
                .map_err(|_| Error::validation(format!("invalid exit code range '{s}'")))?;
            if lo > hi || hi > 255 {
                return Err(Error::validation(format!("invalid exit code range '{s}'")));
            }
            Ok((lo..=hi).map(|n| n as u8).collect())
        }
    }
}

fn require_non_blank(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn new_state(
    operation: Operation,
    inputs: Vec<(Rc<OpNode>, u32)>,
    platform: Option<Platform>,
    origin: SourceLocation,
) -> State {
    State::new(OpNode::new(operation, inputs, platform, OpMeta::default(), origin))
}

// ---------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------

/// `bk.image(ref, platform?)`.
///
/// A reference with no scheme is normalized to
/// `docker-image://docker.io/library/<ref>`.
pub fn image(reference: &str, platform: Option<Platform>, origin: SourceLocation) -> Result<State> {
    require_non_blank(reference, "identifier")?;
    let identifier = if reference.contains("://") {
        reference.to_string()
    } else {
        format!("docker-image://docker.io/library/{reference}")
    };
    Ok(new_state(
        Operation::Source(SourceSpec {
            identifier,
            attrs: IndexMap::new(),
        }),
        Vec::new(),
        platform,
        origin,
    ))
}

/// `bk.scratch()`: the empty-identifier source.
pub fn scratch(origin: SourceLocation) -> State {
    new_state(
        Operation::Source(SourceSpec {
            identifier: String::new(),
            attrs: IndexMap::new(),
        }),
        Vec::new(),
        None,
        origin,
    )
}

/// Options accepted by [`local_`].
#[derive(Debug, Clone, Default)]
pub struct LocalOpts {
    /// Only include paths matching at least one of these patterns.
    pub include: Vec<String>,
    /// Exclude paths matching any of these patterns.
    pub exclude: Vec<String>,
    /// A hint used to group concurrent builds sharing the same context.
    pub shared_key_hint: Option<String>,
}

/// `bk.local_(name, opts?)`.
pub fn local_(name: &str, opts: LocalOpts, origin: SourceLocation) -> Result<State> {
    require_non_blank(name, "name")?;
    let mut attrs = IndexMap::new();
    for (i, pattern) in opts.include.iter().enumerate() {
        attrs.insert(format!("includepattern{i}"), pattern.clone());
    }
    for (i, pattern) in opts.exclude.iter().enumerate() {
        attrs.insert(format!("excludepattern{i}"), pattern.clone());
    }
    if let Some(hint) = opts.shared_key_hint {
        attrs.insert("sharedkeyhint".to_string(), hint);
    }
    Ok(new_state(
        Operation::Source(SourceSpec {
            identifier: format!("local://{name}"),
            attrs,
        }),
        Vec::new(),
        None,
        origin,
    ))
}

/// `bk.git(url, ref?, opts?)`.
pub fn git(url: &str, git_ref: Option<&str>, keep_git_dir: bool, origin: SourceLocation) -> Result<State> {
    require_non_blank(url, "URL")?;
    let identifier = match git_ref {
        Some(r) if !r.is_empty() => format!("git://{url}#{r}"),
        _ => format!("git://{url}"),
    };
    let mut attrs = IndexMap::new();
    if keep_git_dir {
        attrs.insert("keepgitdir".to_string(), "true".to_string());
    }
    Ok(new_state(
        Operation::Source(SourceSpec { identifier, attrs }),
        Vec::new(),
        None,
        origin,
    ))
}

/// Options accepted by [`http`].
#[derive(Debug, Clone, Default)]
pub struct HttpOpts {
    /// Expected content checksum.
    pub checksum: Option<String>,
    /// Override for the destination filename.
    pub filename: Option<String>,
    /// Permission bits for the downloaded file.
    pub mode: Option<ModeValue>,
    /// Extra HTTP request headers.
    pub headers: IndexMap<String, String>,
    /// HTTP basic auth credentials, as `(user, pass)`.
    pub basic_auth: Option<(String, String)>,
}

/// `bk.http(url, opts?)` / `bk.https(url, opts?)`. The URL is used verbatim
/// as the source identifier.
pub fn http(url: &str, opts: HttpOpts, origin: SourceLocation) -> Result<State> {
    require_non_blank(url, "URL")?;
    let mut attrs = IndexMap::new();
    if let Some(checksum) = opts.checksum {
        attrs.insert("checksum".to_string(), checksum);
    }
    if let Some(filename) = opts.filename {
        attrs.insert("filename".to_string(), filename);
    }
    if let Some(mode) = &opts.mode {
        let m = parse_mode(mode)?;
        attrs.insert("mode".to_string(), format!("{m:o}"));
    }
    for (name, value) in opts.headers {
        attrs.insert(format!("http.header.{name}"), value);
    }
    if let Some((user, pass)) = opts.basic_auth {
        attrs.insert("http.basicauth".to_string(), format!("{user}:{pass}"));
    }
    Ok(new_state(
        Operation::Source(SourceSpec {
            identifier: url.to_string(),
            attrs,
        }),
        Vec::new(),
        None,
        origin,
    ))
}

// ---------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------

/// A `run()` command argument: either a shell string or an explicit argv.
#[derive(Debug, Clone)]
pub enum Command {
    /// Wrapped as `["/bin/sh", "-c", s]`.
    Shell(String),
    /// Used exactly as given; must be non-empty.
    Argv(Vec<String>),
}

/// Options accepted by [`run`].
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// `KEY=VALUE` environment overrides, applied in order.
    pub env: Vec<(String, String)>,
    /// Working directory override.
    pub cwd: Option<String>,
    /// User override.
    pub user: Option<String>,
    /// Hostname override.
    pub hostname: Option<String>,
    /// Attached mounts, in declaration order. [`crate::mount::Mount::Bind`]
    /// entries add additional input edges, in the order they appear here,
    /// immediately after the base filesystem input.
    pub mounts: Vec<Mount>,
    /// Network isolation mode; defaults to [`NetworkMode::Unset`].
    pub network: Option<NetworkMode>,
    /// Security sandboxing mode; defaults to [`SecurityMode::Sandbox`].
    pub security: Option<SecurityMode>,
    /// Exit codes that do not count as a failure.
    pub valid_exit_codes: Option<ExitCodes>,
}

/// `state:run(command, opts?)`.
pub fn run(base: &State, command: Command, opts: RunOpts, origin: SourceLocation) -> Result<State> {
    let argv = match command {
        Command::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s],
        Command::Argv(argv) => {
            if argv.is_empty() {
                return Err(Error::validation("command argument required"));
            }
            argv
        }
    };
    let valid_exit_codes = match &opts.valid_exit_codes {
        Some(codes) => parse_exit_codes(codes)?,
        None => Vec::new(),
    };

    let mut inputs = vec![(Rc::clone(base.node()), 0)];
    for mount in &opts.mounts {
        if let Mount::Bind { source, .. } = mount {
            inputs.push((Rc::clone(source.node()), 0));
        }
    }

    let spec = ExecSpec {
        argv,
        env: opts.env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
        cwd: opts.cwd,
        user: opts.user,
        hostname: opts.hostname,
        mounts: opts.mounts,
        network: opts.network.unwrap_or_default(),
        security: opts.security.unwrap_or_default(),
        valid_exit_codes,
    };

    Ok(new_state(
        Operation::Exec(spec),
        inputs,
        base.effective_platform().cloned(),
        origin,
    ))
}

// ---------------------------------------------------------------------
// File actions
// ---------------------------------------------------------------------

/// Options accepted by [`copy`].
#[derive(Debug, Clone, Default)]
pub struct CopyOpts {
    /// Permission bits override.
    pub mode: Option<ModeValue>,
    /// Resolve symlinks in the source path.
    pub follow_symlink: bool,
    /// Create missing destination parent directories.
    pub create_dest_path: bool,
    /// Allow glob wildcards in the source path.
    pub allow_wildcard: bool,
    /// Only copy paths matching at least one of these patterns.
    pub include: Vec<String>,
    /// Exclude paths matching any of these patterns.
    pub exclude: Vec<String>,
    /// Ownership override.
    pub owner: Option<crate::ir::ChownSpec>,
}

/// `dest:copy(src, src_path, dest_path, opts?)`.
pub fn copy(dest: &State, src: &State, src_path: &str, dest_path: &str, opts: CopyOpts, origin: SourceLocation) -> Result<State> {
    let mode = opts.mode.as_ref().map(parse_mode).transpose()?;
    let (inputs, src_input_index) = if dest.is_same_node(src) {
        (vec![(Rc::clone(dest.node()), 0)], 0)
    } else {
        (
            vec![(Rc::clone(dest.node()), 0), (Rc::clone(src.node()), 0)],
            1,
        )
    };
    let action = FileAction::Copy {
        src_input_index,
        source_path: src_path.to_string(),
        dest_path: dest_path.to_string(),
        mode,
        follow_symlink: opts.follow_symlink,
        create_dest_path: opts.create_dest_path,
        allow_wildcard: opts.allow_wildcard,
        include: opts.include,
        exclude: opts.exclude,
        owner: opts.owner,
    };
    Ok(new_state(
        Operation::File(action),
        inputs,
        dest.effective_platform().cloned(),
        origin,
    ))
}

/// Options accepted by [`mkdir`].
#[derive(Debug, Clone, Default)]
pub struct MkdirOpts {
    /// Permission bits; defaults to `0o755`.
    pub mode: Option<ModeValue>,
    /// Create parent directories as needed.
    pub make_parents: bool,
    /// Ownership override.
    pub owner: Option<crate::ir::ChownSpec>,
}

/// `state:mkdir(path, opts?)`.
pub fn mkdir(base: &State, path: &str, opts: MkdirOpts, origin: SourceLocation) -> Result<State> {
    require_non_blank(path, "path")?;
    let mode = match &opts.mode {
        Some(m) => parse_mode(m)?,
        None => 0o755,
    };
    let action = FileAction::Mkdir {
        path: path.to_string(),
        mode,
        make_parents: opts.make_parents,
        owner: opts.owner,
    };
    Ok(new_state(
        Operation::File(action),
        vec![(Rc::clone(base.node()), 0)],
        base.effective_platform().cloned(),
        origin,
    ))
}

/// Options accepted by [`mkfile`].
#[derive(Debug, Clone, Default)]
pub struct MkfileOpts {
    /// Permission bits; defaults to `0o644`.
    pub mode: Option<ModeValue>,
    /// Ownership override.
    pub owner: Option<crate::ir::ChownSpec>,
}

/// `state:mkfile(path, data, opts?)`.
pub fn mkfile(base: &State, path: &str, data: Vec<u8>, opts: MkfileOpts, origin: SourceLocation) -> Result<State> {
    require_non_blank(path, "path")?;
    let mode = match &opts.mode {
        Some(m) => parse_mode(m)?,
        None => 0o644,
    };
    let action = FileAction::Mkfile {
        path: path.to_string(),
        data,
        mode,
        owner: opts.owner,
    };
    Ok(new_state(
        Operation::File(action),
        vec![(Rc::clone(base.node()), 0)],
        base.effective_platform().cloned(),
        origin,
    ))
}

/// Options accepted by [`rm`].
#[derive(Debug, Clone, Default)]
pub struct RmOpts {
    /// Do not fail if the path does not exist.
    pub allow_not_found: bool,
    /// Allow glob wildcards in the path.
    pub allow_wildcard: bool,
}

/// `state:rm(path, opts?)`.
pub fn rm(base: &State, path: &str, opts: RmOpts, origin: SourceLocation) -> Result<State> {
    require_non_blank(path, "path")?;
    let action = FileAction::Rm {
        path: path.to_string(),
        allow_not_found: opts.allow_not_found,
        allow_wildcard: opts.allow_wildcard,
    };
    Ok(new_state(
        Operation::File(action),
        vec![(Rc::clone(base.node()), 0)],
        base.effective_platform().cloned(),
        origin,
    ))
}

/// `state:symlink(oldpath, newpath)`.
pub fn symlink(base: &State, oldpath: &str, newpath: &str, origin: SourceLocation) -> Result<State> {
    require_non_blank(oldpath, "oldpath")?;
    require_non_blank(newpath, "newpath")?;
    let action = FileAction::Symlink {
        oldpath: oldpath.to_string(),
        newpath: newpath.to_string(),
    };
    Ok(new_state(
        Operation::File(action),
        vec![(Rc::clone(base.node()), 0)],
        base.effective_platform().cloned(),
        origin,
    ))
}

// ---------------------------------------------------------------------
// Graph combinators
// ---------------------------------------------------------------------

/// `bk.merge(a, b, ...)`: requires at least 2 states.
pub fn merge(states: &[State], origin: SourceLocation) -> Result<State> {
    if states.len() < 2 {
        return Err(Error::validation("requires at least 2 states"));
    }
    let platform = states[0].effective_platform().cloned();
    let inputs = states.iter().map(|s| (Rc::clone(s.node()), 0)).collect();
    Ok(new_state(Operation::Merge, inputs, platform, origin))
}

/// `bk.diff(lower, upper)`: requires exactly 2 states.
pub fn diff(states: &[State], origin: SourceLocation) -> Result<State> {
    let [lower, upper] = states else {
        return Err(Error::validation("requires lower and upper"));
    };
    let platform = lower.effective_platform().cloned();
    let inputs = vec![(Rc::clone(lower.node()), 0), (Rc::clone(upper.node()), 0)];
    Ok(new_state(Operation::Diff, inputs, platform, origin))
}

/// `state:with_metadata(description?, progress_group?)`.
///
/// Returns a new `State` referencing a new node with the same operation and
/// inputs as `state`, but augmented metadata.
pub fn with_metadata(state: &State, description: Option<String>, progress_group: Option<ProgressGroup>) -> State {
    let node = state.node();
    let mut meta = node.meta().clone();
    if let Some(description) = description {
        meta.description.insert("llb.custom".to_string(), description);
    }
    if let Some(pg) = progress_group {
        meta.progress_group = Some(pg);
    }
    let new_node = OpNode::new(
        node.operation().clone(),
        node.inputs().to_vec(),
        node.platform().cloned(),
        meta,
        node.origin().clone(),
    );
    State::new(new_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLocation {
        SourceLocation {
            file: "t.lua".into(),
            line: 1,
        }
    }

    #[test]
    fn image_ref_without_scheme_is_normalized() {
        let s = image("alpine:3.19", None, loc()).unwrap();
        match s.node().operation() {
            Operation::Source(spec) => assert_eq!(spec.identifier, "docker-image://docker.io/library/alpine:3.19"),
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn image_ref_with_scheme_is_used_verbatim() {
        let s = image("docker-image://docker.io/library/alpine:3.19", None, loc()).unwrap();
        match s.node().operation() {
            Operation::Source(spec) => assert_eq!(spec.identifier, "docker-image://docker.io/library/alpine:3.19"),
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn blank_image_ref_is_rejected() {
        let err = image("   ", None, loc()).unwrap_err();
        assert_eq!(err.to_string(), "identifier must not be empty");
    }

    #[test]
    fn local_with_patterns() {
        let opts = LocalOpts {
            include: vec!["*.go".to_string()],
            exclude: vec!["vendor/".to_string()],
            shared_key_hint: Some("go".to_string()),
        };
        let s = local_("context", opts, loc()).unwrap();
        match s.node().operation() {
            Operation::Source(spec) => {
                assert_eq!(spec.identifier, "local://context");
                assert_eq!(spec.attrs.get("includepattern0"), Some(&"*.go".to_string()));
                assert_eq!(spec.attrs.get("excludepattern0"), Some(&"vendor/".to_string()));
                assert_eq!(spec.attrs.get("sharedkeyhint"), Some(&"go".to_string()));
            }
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn git_ref_is_appended_as_fragment() {
        let s = git("https://example.com/repo.git", Some("main"), false, loc()).unwrap();
        match s.node().operation() {
            Operation::Source(spec) => {
                assert_eq!(spec.identifier, "git://https://example.com/repo.git#main");
                assert!(!spec.attrs.contains_key("keepgitdir"));
            }
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn git_keep_git_dir_sets_attr() {
        let s = git("https://example.com/repo.git", None, true, loc()).unwrap();
        match s.node().operation() {
            Operation::Source(spec) => assert_eq!(spec.attrs.get("keepgitdir"), Some(&"true".to_string())),
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn run_wraps_shell_strings() {
        let base = image("alpine:3.19", None, loc()).unwrap();
        let ran = run(&base, Command::Shell("echo hello".to_string()), RunOpts::default(), loc()).unwrap();
        match ran.node().operation() {
            Operation::Exec(spec) => assert_eq!(spec.argv, vec!["/bin/sh", "-c", "echo hello"]),
            _ => panic!("expected exec"),
        }
        assert_eq!(ran.node().inputs().len(), 1);
    }

    #[test]
    fn run_rejects_empty_argv() {
        let base = scratch(loc());
        let err = run(&base, Command::Argv(vec![]), RunOpts::default(), loc()).unwrap_err();
        assert_eq!(err.to_string(), "command argument required");
    }

    #[test]
    fn merge_requires_at_least_two() {
        let a = scratch(loc());
        let err = merge(&[a], loc()).unwrap_err();
        assert_eq!(err.to_string(), "requires at least 2 states");
    }

    #[test]
    fn merge_of_three_keeps_order() {
        let a = image("alpine", None, loc()).unwrap();
        let b = image("debian", None, loc()).unwrap();
        let c = image("busybox", None, loc()).unwrap();
        let m = merge(&[a.clone(), b.clone(), c.clone()], loc()).unwrap();
        assert_eq!(m.node().inputs().len(), 3);
        assert!(Rc::ptr_eq(&m.node().inputs()[0].0, a.node()));
        assert!(Rc::ptr_eq(&m.node().inputs()[2].0, c.node()));
    }

    #[test]
    fn diff_has_exactly_two_inputs() {
        let base = image("alpine", None, loc()).unwrap();
        let upper = run(&base, Command::Shell("apk add nginx".to_string()), RunOpts::default(), loc()).unwrap();
        let d = diff(&[base.clone(), upper.clone()], loc()).unwrap();
        assert_eq!(d.node().inputs().len(), 2);
        assert!(Rc::ptr_eq(&d.node().inputs()[0].0, base.node()));
        assert!(Rc::ptr_eq(&d.node().inputs()[1].0, upper.node()));
    }

    #[test]
    fn diff_rejects_wrong_arity() {
        let base = scratch(loc());
        let err = diff(&[base], loc()).unwrap_err();
        assert_eq!(err.to_string(), "requires lower and upper");
    }

    #[test]
    fn valid_exit_codes_range_expands() {
        assert_eq!(parse_exit_codes(&ExitCodes::Range("0..255".to_string())).unwrap().len(), 256);
        assert!(parse_exit_codes(&ExitCodes::Range("5..0".to_string())).is_err());
        assert!(parse_exit_codes(&ExitCodes::Range("0..256".to_string())).is_err());
    }

    #[test]
    fn mode_string_is_octal_number_is_literal() {
        assert_eq!(parse_mode(&ModeValue::Str("0755".to_string())).unwrap(), 0o755);
        assert_eq!(parse_mode(&ModeValue::Num(755)).unwrap(), 755);
    }

    #[test]
    fn with_metadata_preserves_operation_and_inputs() {
        let base = scratch(loc());
        let annotated = with_metadata(&base, Some("a scratch stage".to_string()), None);
        assert!(!annotated.is_same_node(&base));
        assert_eq!(
            annotated.node().meta().description.get("llb.custom"),
            Some(&"a scratch stage".to_string())
        );
    }
}
