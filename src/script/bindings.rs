//! API bindings: the global `bk` table and the `State` method surface,
//! mapping duck-typed Lua arguments onto the typed constructors in
//! [`crate::ops`].
//!
//! Every function here does exactly two things: convert Lua values into the
//! Rust types `crate::ops` expects (raising [`Error::Validation`] for wrong
//! types), and capture the call site via [`crate::script::callsite`]. The
//! actual construction, validation and normalization rules live in
//! `crate::ops` itself, so the contract is identical whether a node is
//! built from Lua or (in tests) directly from Rust.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use mlua::{Lua, Table, UserData, UserDataMethods, Value, Variadic};

use crate::error::{Error, Result};
use crate::export::ExportSlot;
use crate::image_config::ImageConfig;
use crate::ir::{ChownSpec, ProgressGroup, State, UserRef};
use crate::mount::{self, Mount};
use crate::ops::{self, Command, CopyOpts, ExitCodes, HttpOpts, LocalOpts, MkdirOpts, MkfileOpts, ModeValue, RmOpts, RunOpts};
use crate::platform::Platform;
use crate::script::callsite;

/// The script-visible handle over a [`State`].
#[derive(Debug, Clone)]
pub struct LuaState(
    /// The wrapped handle.
    pub State,
);

impl<'lua> mlua::FromLua<'lua> for LuaState {
    fn from_lua(value: Value<'lua>, _lua: &'lua Lua) -> mlua::Result<Self> {
        match value {
            Value::UserData(ud) => Ok(ud.borrow::<LuaState>()?.clone()),
            other => Err(mlua::Error::FromLuaConversionError {
                from: other.type_name(),
                to: "State",
                message: Some("expected a build state".to_string()),
            }),
        }
    }
}

impl<'lua> mlua::IntoLua<'lua> for LuaState {
    fn into_lua(self, lua: &'lua Lua) -> mlua::Result<Value<'lua>> {
        Ok(Value::UserData(lua.create_userdata(self)?))
    }
}

impl UserData for LuaState {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_method("run", |lua, this, (command, opts): (Value, Option<Table>)| {
            let origin = callsite::capture(lua);
            let command = parse_command(command).map_err(mlua::Error::external)?;
            let opts = opts.map(parse_run_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
            let state = ops::run(&this.0, command, opts, origin).map_err(mlua::Error::external)?;
            Ok(LuaState(state))
        });

        methods.add_method(
            "copy",
            |lua, this, (src, src_path, dest_path, opts): (LuaState, String, String, Option<Table>)| {
                let origin = callsite::capture(lua);
                let opts = opts.map(parse_copy_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
                let state = ops::copy(&this.0, &src.0, &src_path, &dest_path, opts, origin).map_err(mlua::Error::external)?;
                Ok(LuaState(state))
            },
        );

        methods.add_method("mkdir", |lua, this, (path, opts): (String, Option<Table>)| {
            let origin = callsite::capture(lua);
            let opts = opts.map(parse_mkdir_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
            let state = ops::mkdir(&this.0, &path, opts, origin).map_err(mlua::Error::external)?;
            Ok(LuaState(state))
        });

        methods.add_method(
            "mkfile",
            |lua, this, (path, data, opts): (String, mlua::String, Option<Table>)| {
                let origin = callsite::capture(lua);
                let opts = opts.map(parse_mkfile_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
                let state = ops::mkfile(&this.0, &path, data.as_bytes().to_vec(), opts, origin).map_err(mlua::Error::external)?;
                Ok(LuaState(state))
            },
        );

        methods.add_method("rm", |lua, this, (path, opts): (String, Option<Table>)| {
            let origin = callsite::capture(lua);
            let opts = opts.map(parse_rm_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
            let state = ops::rm(&this.0, &path, opts, origin).map_err(mlua::Error::external)?;
            Ok(LuaState(state))
        });

        methods.add_method("symlink", |lua, this, (oldpath, newpath): (String, String)| {
            let origin = callsite::capture(lua);
            let state = ops::symlink(&this.0, &oldpath, &newpath, origin).map_err(mlua::Error::external)?;
            Ok(LuaState(state))
        });

        methods.add_method("with_metadata", |_lua, this, opts: Option<Value>| {
            let (description, progress_group) = parse_with_metadata(opts).map_err(mlua::Error::external)?;
            Ok(LuaState(ops::with_metadata(&this.0, description, progress_group)))
        });
    }
}

/// The script-visible handle over a [`Platform`].
#[derive(Debug, Clone)]
pub struct LuaPlatform(
    /// The wrapped platform value.
    pub Platform,
);

impl UserData for LuaPlatform {}

/// The script-visible handle over a [`Mount`].
#[derive(Debug, Clone)]
pub struct LuaMount(
    /// The wrapped mount value.
    pub Mount,
);

impl UserData for LuaMount {}

impl<'lua> mlua::FromLua<'lua> for LuaMount {
    fn from_lua(value: Value<'lua>, _lua: &'lua Lua) -> mlua::Result<Self> {
        match value {
            Value::UserData(ud) => Ok(ud.borrow::<LuaMount>()?.clone()),
            other => Err(mlua::Error::FromLuaConversionError {
                from: other.type_name(),
                to: "Mount",
                message: Some("expected a value returned by bk.cache/secret/ssh/tmpfs/bind".to_string()),
            }),
        }
    }
}

// ---------------------------------------------------------------------
// Argument coercion helpers
// ---------------------------------------------------------------------

fn parse_command(value: Value) -> Result<Command> {
    match value {
        Value::String(s) => Ok(Command::Shell(s.to_str()?.to_string())),
        Value::Table(t) => {
            let argv = t.sequence_values::<String>().collect::<mlua::Result<Vec<_>>>()?;
            Ok(Command::Argv(argv))
        }
        other => Err(Error::validation(format!(
            "run: expected a command string or argv table, got {}",
            other.type_name()
        ))),
    }
}

fn parse_mode_value(value: Value) -> Result<ModeValue> {
    match value {
        Value::String(s) => Ok(ModeValue::Str(s.to_str()?.to_string())),
        Value::Integer(n) => Ok(ModeValue::Num(n)),
        Value::Number(n) => Ok(ModeValue::Num(n as i64)),
        other => Err(Error::validation(format!("mode: unsupported value type {}", other.type_name()))),
    }
}

fn parse_exit_codes(value: Value) -> Result<ExitCodes> {
    match value {
        Value::Integer(n) => Ok(ExitCodes::Single(n)),
        Value::Number(n) => Ok(ExitCodes::Single(n as i64)),
        Value::String(s) => Ok(ExitCodes::Range(s.to_str()?.to_string())),
        Value::Table(t) => Ok(ExitCodes::List(t.sequence_values::<i64>().collect::<mlua::Result<Vec<_>>>()?)),
        other => Err(Error::validation(format!(
            "valid_exit_codes: unsupported value type {}",
            other.type_name()
        ))),
    }
}

fn parse_chown_ref(value: Value) -> Result<UserRef> {
    match value {
        Value::String(s) => Ok(UserRef::Name(s.to_str()?.to_string())),
        Value::Integer(n) => {
            Ok(UserRef::Id(u32::try_from(n).map_err(|_| Error::validation(format!("owner id out of range: {n}")))?))
        }
        other => Err(Error::validation(format!("owner: unsupported value type {}", other.type_name()))),
    }
}

/// Raise `unknown field '<k>'` for the first key in `t` that isn't in
/// `allowed`. Every Lua-facing option table is checked this way before its
/// recognized keys are read, so a typo'd or stray key is a hard error
/// rather than a silent no-op.
fn reject_unknown_keys(t: &Table, allowed: &[&str]) -> Result<()> {
    for pair in t.clone().pairs::<String, Value>() {
        let (key, _) = pair.map_err(Error::from)?;
        if !allowed.contains(&key.as_str()) {
            return Err(Error::validation(format!("unknown field '{key}'")));
        }
    }
    Ok(())
}

fn parse_owner(t: &Table) -> Result<Option<ChownSpec>> {
    let owner: Option<Table> = t.get("owner")?;
    let Some(owner) = owner else { return Ok(None) };
    reject_unknown_keys(&owner, &["user", "group"])?;
    let user = match owner.get::<Option<Value>>("user")? {
        Some(v) => Some(parse_chown_ref(v)?),
        None => None,
    };
    let group = match owner.get::<Option<Value>>("group")? {
        Some(v) => Some(parse_chown_ref(v)?),
        None => None,
    };
    Ok(Some(ChownSpec { user, group }))
}

fn parse_string_array(t: &Table, key: &str) -> Result<Vec<String>> {
    Ok(t.get::<Option<Vec<String>>>(key)?.unwrap_or_default())
}

fn parse_network_mode(s: &str) -> Result<crate::ir::NetworkMode> {
    match s {
        "unset" => Ok(crate::ir::NetworkMode::Unset),
        "host" => Ok(crate::ir::NetworkMode::Host),
        "none" => Ok(crate::ir::NetworkMode::None),
        other => Err(Error::validation(format!("unknown network mode '{other}'"))),
    }
}

fn parse_security_mode(s: &str) -> Result<crate::ir::SecurityMode> {
    match s {
        "sandbox" => Ok(crate::ir::SecurityMode::Sandbox),
        "insecure" => Ok(crate::ir::SecurityMode::Insecure),
        other => Err(Error::validation(format!("unknown security mode '{other}'"))),
    }
}

fn parse_sharing_mode(s: &str) -> Result<mount::CacheSharingMode> {
    match s {
        "shared" => Ok(mount::CacheSharingMode::Shared),
        "private" => Ok(mount::CacheSharingMode::Private),
        "locked" => Ok(mount::CacheSharingMode::Locked),
        other => Err(Error::validation(format!("unknown cache sharing mode '{other}'"))),
    }
}

fn coerce_platform(value: Value) -> Result<Option<Platform>> {
    match value {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_str()?.parse()?)),
        Value::Table(t) => {
            reject_unknown_keys(&t, &["os", "arch", "architecture", "variant"])?;
            let os: String = t.get("os")?;
            let architecture: String = match t.get::<Option<String>>("arch")? {
                Some(a) => a,
                None => t.get("architecture")?,
            };
            let variant: Option<String> = t.get("variant")?;
            Ok(Some(Platform { os, architecture, variant }))
        }
        Value::UserData(ud) => Ok(Some(ud.borrow::<LuaPlatform>()?.0.clone())),
        other => Err(Error::validation(format!("platform: unsupported value type {}", other.type_name()))),
    }
}

fn parse_run_opts(t: Table) -> Result<RunOpts> {
    reject_unknown_keys(&t, &["env", "cwd", "user", "hostname", "mounts", "network", "security", "valid_exit_codes"])?;
    let env = match t.get::<Option<Vec<String>>>("env")? {
        Some(list) => list
            .into_iter()
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| Error::validation(format!("invalid env entry '{entry}', expected KEY=VALUE")))
            })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let mounts = match t.get::<Option<Vec<LuaMount>>>("mounts")? {
        Some(list) => list.into_iter().map(|m| m.0).collect(),
        None => Vec::new(),
    };
    let network = match t.get::<Option<String>>("network")? {
        Some(s) => Some(parse_network_mode(&s)?),
        None => None,
    };
    let security = match t.get::<Option<String>>("security")? {
        Some(s) => Some(parse_security_mode(&s)?),
        None => None,
    };
    let valid_exit_codes = match t.get::<Option<Value>>("valid_exit_codes")? {
        Some(v) => Some(parse_exit_codes(v)?),
        None => None,
    };
    Ok(RunOpts {
        env,
        cwd: t.get("cwd")?,
        user: t.get("user")?,
        hostname: t.get("hostname")?,
        mounts,
        network,
        security,
        valid_exit_codes,
    })
}

fn parse_copy_opts(t: Table) -> Result<CopyOpts> {
    reject_unknown_keys(
        &t,
        &["mode", "follow_symlink", "create_dest_path", "allow_wildcard", "include", "exclude", "owner"],
    )?;
    let mode = match t.get::<Option<Value>>("mode")? {
        Some(v) => Some(parse_mode_value(v)?),
        None => None,
    };
    Ok(CopyOpts {
        mode,
        follow_symlink: t.get::<Option<bool>>("follow_symlink")?.unwrap_or(false),
        create_dest_path: t.get::<Option<bool>>("create_dest_path")?.unwrap_or(false),
        allow_wildcard: t.get::<Option<bool>>("allow_wildcard")?.unwrap_or(false),
        include: parse_string_array(&t, "include")?,
        exclude: parse_string_array(&t, "exclude")?,
        owner: parse_owner(&t)?,
    })
}

fn parse_mkdir_opts(t: Table) -> Result<MkdirOpts> {
    reject_unknown_keys(&t, &["mode", "make_parents", "owner"])?;
    let mode = match t.get::<Option<Value>>("mode")? {
        Some(v) => Some(parse_mode_value(v)?),
        None => None,
    };
    Ok(MkdirOpts {
        mode,
        make_parents: t.get::<Option<bool>>("make_parents")?.unwrap_or(false),
        owner: parse_owner(&t)?,
    })
}

fn parse_mkfile_opts(t: Table) -> Result<MkfileOpts> {
    reject_unknown_keys(&t, &["mode", "owner"])?;
    let mode = match t.get::<Option<Value>>("mode")? {
        Some(v) => Some(parse_mode_value(v)?),
        None => None,
    };
    Ok(MkfileOpts { mode, owner: parse_owner(&t)? })
}

fn parse_rm_opts(t: Table) -> Result<RmOpts> {
    reject_unknown_keys(&t, &["allow_not_found", "allow_wildcard"])?;
    Ok(RmOpts {
        allow_not_found: t.get::<Option<bool>>("allow_not_found")?.unwrap_or(false),
        allow_wildcard: t.get::<Option<bool>>("allow_wildcard")?.unwrap_or(false),
    })
}

fn parse_local_opts(t: Table) -> Result<LocalOpts> {
    reject_unknown_keys(&t, &["include", "exclude", "shared_key_hint"])?;
    Ok(LocalOpts {
        include: parse_string_array(&t, "include")?,
        exclude: parse_string_array(&t, "exclude")?,
        shared_key_hint: t.get("shared_key_hint")?,
    })
}

fn parse_http_opts(t: Table) -> Result<HttpOpts> {
    reject_unknown_keys(&t, &["checksum", "filename", "mode", "headers", "basic_auth"])?;
    let mode = match t.get::<Option<Value>>("mode")? {
        Some(v) => Some(parse_mode_value(v)?),
        None => None,
    };
    let mut headers = IndexMap::new();
    if let Some(h) = t.get::<Option<Table>>("headers")? {
        for pair in h.pairs::<String, String>() {
            let (k, v) = pair?;
            headers.insert(k, v);
        }
    }
    let basic_auth = match t.get::<Option<Table>>("basic_auth")? {
        Some(ba) => {
            reject_unknown_keys(&ba, &["user", "pass"])?;
            Some((ba.get::<String>("user")?, ba.get::<String>("pass")?))
        }
        None => None,
    };
    Ok(HttpOpts {
        checksum: t.get("checksum")?,
        filename: t.get("filename")?,
        mode,
        headers,
        basic_auth,
    })
}

fn parse_with_metadata(value: Option<Value>) -> Result<(Option<String>, Option<ProgressGroup>)> {
    match value {
        None | Some(Value::Nil) => Ok((None, None)),
        Some(Value::String(s)) => Ok((Some(s.to_str()?.to_string()), None)),
        Some(Value::Table(t)) => {
            reject_unknown_keys(&t, &["description", "progress_group"])?;
            let description: Option<String> = t.get("description")?;
            let pg: Option<Table> = t.get("progress_group")?;
            let progress_group = match pg {
                Some(pg) => {
                    reject_unknown_keys(&pg, &["id", "name", "weak"])?;
                    Some(ProgressGroup {
                        id: pg.get("id")?,
                        name: pg.get::<Option<String>>("name")?.unwrap_or_default(),
                        weak: pg.get::<Option<bool>>("weak")?.unwrap_or(false),
                    })
                }
                None => None,
            };
            Ok((description, progress_group))
        }
        Some(other) => Err(Error::validation(format!(
            "with_metadata: unsupported argument type {}",
            other.type_name()
        ))),
    }
}

fn parse_image_config(t: &Table) -> Result<ImageConfig> {
    reject_unknown_keys(
        t,
        &["entrypoint", "cmd", "env", "workdir", "user", "expose", "labels", "os", "arch", "variant"],
    )?;
    let mut cfg = ImageConfig::default();
    if let Some(v) = t.get::<Option<Vec<String>>>("entrypoint")? {
        cfg.entrypoint = Some(v);
    }
    if let Some(v) = t.get::<Option<Vec<String>>>("cmd")? {
        cfg.cmd = Some(v);
    }
    if let Some(env) = t.get::<Option<Table>>("env")? {
        for pair in env.pairs::<String, String>() {
            let (k, v) = pair?;
            cfg.env.push(format!("{k}={v}"));
        }
    }
    if let Some(v) = t.get::<Option<String>>("workdir")? {
        cfg.workdir = Some(v);
    }
    if let Some(v) = t.get::<Option<String>>("user")? {
        cfg.user = Some(v);
    }
    if let Some(ports) = t.get::<Option<Vec<String>>>("expose")? {
        for port in ports {
            cfg.exposed_ports.insert(port, ());
        }
    }
    if let Some(labels) = t.get::<Option<Table>>("labels")? {
        // Last write wins on duplicate keys: `IndexMap::insert` overwrites
        // the value while preserving the first-seen position, matching
        // upstream's own map-based merge (see DESIGN.md).
        for pair in labels.pairs::<String, String>() {
            let (k, v) = pair?;
            cfg.labels.insert(k, v);
        }
    }
    if let Some(v) = t.get::<Option<String>>("os")? {
        cfg.os = v;
    }
    if let Some(v) = t.get::<Option<String>>("arch")? {
        cfg.architecture = v;
    }
    if let Some(v) = t.get::<Option<String>>("variant")? {
        cfg.variant = Some(v);
    }
    Ok(cfg)
}

// ---------------------------------------------------------------------
// Top-level `bk` functions
// ---------------------------------------------------------------------

fn image(lua: &Lua, (reference, opts): (String, Option<Table>)) -> mlua::Result<LuaState> {
    let origin = callsite::capture(lua);
    let platform = match &opts {
        Some(t) => {
            reject_unknown_keys(t, &["platform"]).map_err(mlua::Error::external)?;
            coerce_platform(t.get("platform")?).map_err(mlua::Error::external)?
        }
        None => None,
    };
    Ok(LuaState(ops::image(&reference, platform, origin).map_err(mlua::Error::external)?))
}

fn scratch(lua: &Lua, _: ()) -> mlua::Result<LuaState> {
    Ok(LuaState(ops::scratch(callsite::capture(lua))))
}

fn local_(lua: &Lua, (name, opts): (String, Option<Table>)) -> mlua::Result<LuaState> {
    let origin = callsite::capture(lua);
    let opts = opts.map(parse_local_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
    Ok(LuaState(ops::local_(&name, opts, origin).map_err(mlua::Error::external)?))
}

fn git(lua: &Lua, (url, opts): (String, Option<Table>)) -> mlua::Result<LuaState> {
    let origin = callsite::capture(lua);
    let (git_ref, keep_git_dir) = match &opts {
        Some(t) => {
            reject_unknown_keys(t, &["ref", "keep_git_dir"]).map_err(mlua::Error::external)?;
            (t.get::<Option<String>>("ref")?, t.get::<Option<bool>>("keep_git_dir")?.unwrap_or(false))
        }
        None => (None, false),
    };
    Ok(LuaState(ops::git(&url, git_ref.as_deref(), keep_git_dir, origin).map_err(mlua::Error::external)?))
}

fn http(lua: &Lua, (url, opts): (String, Option<Table>)) -> mlua::Result<LuaState> {
    let origin = callsite::capture(lua);
    let opts = opts.map(parse_http_opts).transpose().map_err(mlua::Error::external)?.unwrap_or_default();
    Ok(LuaState(ops::http(&url, opts, origin).map_err(mlua::Error::external)?))
}

fn merge(lua: &Lua, states: Variadic<LuaState>) -> mlua::Result<LuaState> {
    let origin = callsite::capture(lua);
    let states: Vec<State> = states.into_iter().map(|s| s.0).collect();
    Ok(LuaState(ops::merge(&states, origin).map_err(mlua::Error::external)?))
}

fn diff(lua: &Lua, states: Variadic<LuaState>) -> mlua::Result<LuaState> {
    let origin = callsite::capture(lua);
    let states: Vec<State> = states.into_iter().map(|s| s.0).collect();
    Ok(LuaState(ops::diff(&states, origin).map_err(mlua::Error::external)?))
}

fn platform_fn(_lua: &Lua, (os, arch, variant): (String, String, Option<String>)) -> mlua::Result<LuaPlatform> {
    Ok(LuaPlatform(Platform { os, architecture: arch, variant }))
}

fn cache_fn(_lua: &Lua, (dest, id, opts): (String, String, Option<Table>)) -> mlua::Result<LuaMount> {
    let sharing = match &opts {
        Some(t) => {
            reject_unknown_keys(t, &["sharing"]).map_err(mlua::Error::external)?;
            match t.get::<Option<String>>("sharing")? {
                Some(s) => Some(parse_sharing_mode(&s).map_err(mlua::Error::external)?),
                None => None,
            }
        }
        None => None,
    };
    Ok(LuaMount(mount::cache(dest, id, sharing)))
}

fn secret_fn(_lua: &Lua, (dest, opts): (String, Option<Table>)) -> mlua::Result<LuaMount> {
    if let Some(t) = &opts {
        reject_unknown_keys(t, &["id", "uid", "gid", "mode", "optional"]).map_err(mlua::Error::external)?;
    }
    let id: String = match &opts {
        Some(t) => t.get("id")?,
        None => return Err(mlua::Error::external(Error::validation("secret: 'id' is required"))),
    };
    let uid = match &opts {
        Some(t) => t.get::<Option<u32>>("uid")?.unwrap_or(0),
        None => 0,
    };
    let gid = match &opts {
        Some(t) => t.get::<Option<u32>>("gid")?.unwrap_or(0),
        None => 0,
    };
    let mode = match &opts {
        Some(t) => match t.get::<Option<Value>>("mode")? {
            Some(v) => Some(ops::parse_mode(&parse_mode_value(v).map_err(mlua::Error::external)?).map_err(mlua::Error::external)?),
            None => None,
        },
        None => None,
    };
    let optional = match &opts {
        Some(t) => t.get::<Option<bool>>("optional")?.unwrap_or(false),
        None => false,
    };
    Ok(LuaMount(mount::secret(dest, id, uid, gid, mode, optional)))
}

fn ssh_fn(_lua: &Lua, opts: Option<Table>) -> mlua::Result<LuaMount> {
    if let Some(t) = &opts {
        reject_unknown_keys(t, &["dest", "id", "uid", "gid", "mode", "optional"]).map_err(mlua::Error::external)?;
    }
    let dest: Option<String> = match &opts {
        Some(t) => t.get("dest")?,
        None => None,
    };
    let id: String = match &opts {
        Some(t) => t.get::<Option<String>>("id")?.unwrap_or_default(),
        None => String::new(),
    };
    let uid = match &opts {
        Some(t) => t.get::<Option<u32>>("uid")?.unwrap_or(0),
        None => 0,
    };
    let gid = match &opts {
        Some(t) => t.get::<Option<u32>>("gid")?.unwrap_or(0),
        None => 0,
    };
    let mode = match &opts {
        Some(t) => match t.get::<Option<Value>>("mode")? {
            Some(v) => Some(ops::parse_mode(&parse_mode_value(v).map_err(mlua::Error::external)?).map_err(mlua::Error::external)?),
            None => None,
        },
        None => None,
    };
    let optional = match &opts {
        Some(t) => t.get::<Option<bool>>("optional")?.unwrap_or(false),
        None => false,
    };
    Ok(LuaMount(mount::ssh(dest, id, uid, gid, mode, optional)))
}

fn tmpfs_fn(_lua: &Lua, (dest, opts): (String, Option<Table>)) -> mlua::Result<LuaMount> {
    let size_bytes = match &opts {
        Some(t) => {
            reject_unknown_keys(t, &["size"]).map_err(mlua::Error::external)?;
            t.get::<Option<u64>>("size")?.unwrap_or(0)
        }
        None => 0,
    };
    Ok(LuaMount(mount::tmpfs(dest, size_bytes)))
}

fn bind_fn(_lua: &Lua, (dest, source, opts): (String, LuaState, Option<Table>)) -> mlua::Result<LuaMount> {
    if let Some(t) = &opts {
        reject_unknown_keys(t, &["selector", "readonly"]).map_err(mlua::Error::external)?;
    }
    let selector: Option<String> = match &opts {
        Some(t) => t.get("selector")?,
        None => None,
    };
    let readonly: Option<bool> = match &opts {
        Some(t) => t.get("readonly")?,
        None => None,
    };
    Ok(LuaMount(mount::bind(dest, source.0, selector, readonly)))
}

/// Install the global `bk` table on `lua`, wiring `bk.export` to `export_slot`.
pub fn install(lua: &Lua, export_slot: Rc<RefCell<ExportSlot>>) -> mlua::Result<()> {
    let bk = lua.create_table()?;
    bk.set("image", lua.create_function(image)?)?;
    bk.set("scratch", lua.create_function(scratch)?)?;
    bk.set("local_", lua.create_function(local_)?)?;
    bk.set("git", lua.create_function(git)?)?;
    bk.set("http", lua.create_function(http)?)?;
    bk.set("https", lua.create_function(http)?)?;
    bk.set("merge", lua.create_function(merge)?)?;
    bk.set("diff", lua.create_function(diff)?)?;
    bk.set("platform", lua.create_function(platform_fn)?)?;
    bk.set("cache", lua.create_function(cache_fn)?)?;
    bk.set("secret", lua.create_function(secret_fn)?)?;
    bk.set("ssh", lua.create_function(ssh_fn)?)?;
    bk.set("tmpfs", lua.create_function(tmpfs_fn)?)?;
    bk.set("bind", lua.create_function(bind_fn)?)?;
    bk.set(
        "export",
        lua.create_function(move |_lua, (state, opts): (LuaState, Option<Table>)| {
            let cfg = match &opts {
                Some(t) => parse_image_config(t).map_err(mlua::Error::external)?,
                None => ImageConfig::default(),
            };
            export_slot
                .borrow_mut()
                .set(Rc::clone(state.0.node()), cfg)
                .map_err(mlua::Error::external)
        })?,
    )?;
    lua.globals().set("bk", bk)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_lua() -> (Lua, Rc<RefCell<ExportSlot>>) {
        let lua = Lua::new();
        let slot = Rc::new(RefCell::new(ExportSlot::new()));
        install(&lua, Rc::clone(&slot)).unwrap();
        (lua, slot)
    }

    #[test]
    fn image_normalizes_bare_reference() {
        let (lua, _) = new_lua();
        lua.load("s = bk.image('alpine:3.19')").exec().unwrap();
        let s: LuaState = lua.globals().get("s").unwrap();
        match s.0.node().operation() {
            crate::ir::Operation::Source(spec) => {
                assert_eq!(spec.identifier, "docker-image://docker.io/library/alpine:3.19");
            }
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn run_accepts_shell_string_and_chains() {
        let (lua, slot) = new_lua();
        lua.load("bk.export(bk.image('alpine:3.19'):run('echo hello'))").exec().unwrap();
        assert!(slot.borrow().is_set());
    }

    #[test]
    fn run_rejects_empty_argv_with_fixed_message() {
        let (lua, _) = new_lua();
        let err = lua.load("bk.image('alpine'):run({})").exec().unwrap_err();
        assert!(err.to_string().contains("command argument required"));
    }

    #[test]
    fn merge_of_three_preserves_order() {
        let (lua, _) = new_lua();
        lua.load(
            r#"
            local a = bk.image('alpine')
            local b = bk.image('debian')
            local c = bk.image('busybox')
            m = bk.merge(a, b, c)
            "#,
        )
        .exec()
        .unwrap();
        let m: LuaState = lua.globals().get("m").unwrap();
        assert_eq!(m.0.node().inputs().len(), 3);
    }

    #[test]
    fn merge_of_one_fails_with_fixed_message() {
        let (lua, _) = new_lua();
        let err = lua.load("bk.merge(bk.scratch())").exec().unwrap_err();
        assert!(err.to_string().contains("requires at least 2 states"));
    }

    #[test]
    fn diff_of_one_fails_with_fixed_message() {
        let (lua, _) = new_lua();
        let err = lua.load("bk.diff(bk.scratch())").exec().unwrap_err();
        assert!(err.to_string().contains("requires lower and upper"));
    }

    #[test]
    fn export_twice_fails_with_fixed_message() {
        let (lua, _) = new_lua();
        let err = lua
            .load(
                r#"
                local s = bk.scratch()
                bk.export(s)
                bk.export(s)
                "#,
            )
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("already called once"));
    }

    #[test]
    fn export_opts_populate_image_config() {
        let (lua, slot) = new_lua();
        lua.load(
            r#"
            bk.export(bk.scratch(), {
                entrypoint = {"/bin/sh"},
                cmd = {"-c", "echo"},
                env = {PATH = "/usr/bin"},
                workdir = "/app",
                user = "u",
                expose = {"8080/tcp"},
                labels = {foo = "bar"},
                os = "linux",
                arch = "arm64",
                variant = "v8",
            })
            "#,
        )
        .exec()
        .unwrap();
        let (_, cfg) = slot.borrow().get().cloned().unwrap();
        assert_eq!(cfg.entrypoint, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(cfg.env, vec!["PATH=/usr/bin".to_string()]);
        assert!(cfg.exposed_ports.contains_key("8080/tcp"));
        assert_eq!(cfg.labels.get("foo"), Some(&"bar".to_string()));
        assert_eq!(cfg.architecture, "arm64");
    }

    #[test]
    fn local_with_patterns_sets_attrs() {
        let (lua, _) = new_lua();
        lua.load(
            r#"
            s = bk.local_('context', {include = {'*.go'}, exclude = {'vendor/'}, shared_key_hint = 'go'})
            "#,
        )
        .exec()
        .unwrap();
        let s: LuaState = lua.globals().get("s").unwrap();
        match s.0.node().operation() {
            crate::ir::Operation::Source(spec) => {
                assert_eq!(spec.attrs.get("includepattern0"), Some(&"*.go".to_string()));
                assert_eq!(spec.attrs.get("sharedkeyhint"), Some(&"go".to_string()));
            }
            _ => panic!("expected source"),
        }
    }

    #[test]
    fn bind_mount_adds_extra_input_edge() {
        let (lua, _) = new_lua();
        lua.load(
            r#"
            local base = bk.image('alpine')
            local side = bk.image('debian')
            out = base:run('true', {mounts = {bk.bind('/side', side)}})
            "#,
        )
        .exec()
        .unwrap();
        let out: LuaState = lua.globals().get("out").unwrap();
        assert_eq!(out.0.node().inputs().len(), 2);
    }

    #[test]
    fn mode_accepts_octal_string_and_bare_number() {
        let (lua, _) = new_lua();
        lua.load(
            r#"
            a = bk.scratch():mkdir('/x', {mode = '0700'})
            b = bk.scratch():mkdir('/x', {mode = 700})
            "#,
        )
        .exec()
        .unwrap();
        let a: LuaState = lua.globals().get("a").unwrap();
        let b: LuaState = lua.globals().get("b").unwrap();
        let mode_of = |s: &LuaState| match s.0.node().operation() {
            crate::ir::Operation::File(crate::ir::FileAction::Mkdir { mode, .. }) => *mode,
            _ => panic!("expected mkdir"),
        };
        assert_eq!(mode_of(&a), 0o700);
        assert_eq!(mode_of(&b), 700);
    }

    #[test]
    fn unrecognized_run_opts_key_fails_with_fixed_message() {
        let (lua, _) = new_lua();
        let err = lua.load("bk.image('alpine'):run('true', {netwrok = 'host'})").exec().unwrap_err();
        assert!(err.to_string().contains("unknown field 'netwrok'"));
    }

    #[test]
    fn unrecognized_export_opts_key_fails_with_fixed_message() {
        let (lua, _) = new_lua();
        let err = lua.load("bk.export(bk.scratch(), {entrypiont = {'/bin/sh'}})").exec().unwrap_err();
        assert!(err.to_string().contains("unknown field 'entrypiont'"));
    }
}
