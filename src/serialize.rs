//! The canonical serializer: walks an [`OpNode`] DAG into a deterministic,
//! content-addressed wire-form [`pb::Definition`].
//!
//! Determinism rests on two things: map-shaped fields in the vendored wire
//! types are `BTreeMap`, not `HashMap` (see `pb::generated::pb`), so prost's
//! derived encoding already iterates them in sorted-key order; and the walk
//! itself collapses structurally-identical nodes (reached by different
//! paths, or built from unrelated calls that happen to produce the same
//! content) into a single `def` entry, keyed by digest rather than by
//! node identity.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::rc::Rc;

use prost::Message;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::image_config::ImageConfig;
use crate::ir::{ChownSpec, FileAction, NetworkMode, OpNode, Operation, SecurityMode, State, UserRef};
use crate::mount::{CacheSharingMode, Mount};
use crate::pb;
use crate::source::SourceRegistry;

/// The digest key format used throughout: `sha256:<hex>`.
fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn platform_to_pb(platform: Option<&crate::platform::Platform>) -> Option<pb::Platform> {
    platform.map(|p| pb::Platform {
        architecture: p.architecture.clone(),
        os: p.os.clone(),
        variant: p.variant.clone().unwrap_or_default(),
        os_version: String::new(),
        os_features: Vec::new(),
    })
}

fn user_ref_to_pb(user: &UserRef) -> pb::UserOpt {
    let variant = match user {
        UserRef::Name(name) => pb::user_opt::User::ByName(pb::NamedUserOpt {
            name: name.clone(),
            input: 0,
        }),
        UserRef::Id(id) => pb::user_opt::User::ById(*id),
    };
    pb::UserOpt { user: Some(variant) }
}

fn chown_to_pb(owner: &Option<ChownSpec>) -> Option<pb::ChownOpt> {
    owner.as_ref().map(|c| pb::ChownOpt {
        user: c.user.as_ref().map(user_ref_to_pb),
        group: c.group.as_ref().map(user_ref_to_pb),
    })
}

fn sorted_attrs(attrs: &indexmap::IndexMap<String, String>) -> BTreeMap<String, String> {
    attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn sorted_caps(caps: &indexmap::IndexMap<String, bool>) -> BTreeMap<String, bool> {
    caps.iter().map(|(k, v)| (k.clone(), *v)).collect()
}

/// Assembles the `ExecOp.mounts` list: an implicit root mount for the base
/// filesystem, followed by one entry per configured [`Mount`]. Bind mounts
/// consume the next sequential input index, in the order they appear here;
/// this must match the input edge order [`crate::ops::run`] constructs.
fn mounts_to_pb(mounts: &[Mount]) -> Vec<pb::Mount> {
    let mut out = vec![pb::Mount {
        input: 0,
        selector: String::new(),
        dest: "/".to_string(),
        output: 0,
        readonly: false,
        mount_type: pb::MountType::Bind as i32,
        tmpfs_opt: None,
        cache_opt: None,
        secret_opt: None,
        ssh_opt: None,
        result_id: String::new(),
    }];
    let mut next_input = 1i64;
    for mount in mounts {
        let pb_mount = match mount {
            Mount::Bind { dest, source: _, selector, readonly } => {
                let m = pb::Mount {
                    input: next_input,
                    selector: selector.clone().unwrap_or_default(),
                    dest: dest.clone(),
                    output: -1,
                    readonly: *readonly,
                    mount_type: pb::MountType::Bind as i32,
                    tmpfs_opt: None,
                    cache_opt: None,
                    secret_opt: None,
                    ssh_opt: None,
                    result_id: String::new(),
                };
                next_input += 1;
                m
            }
            Mount::Cache { dest, id, sharing } => pb::Mount {
                input: -1,
                selector: String::new(),
                dest: dest.clone(),
                output: -1,
                readonly: false,
                mount_type: pb::MountType::Cache as i32,
                tmpfs_opt: None,
                cache_opt: Some(pb::CacheOpt {
                    id: id.clone(),
                    sharing: match sharing {
                        CacheSharingMode::Shared => pb::CacheSharingOpt::Shared as i32,
                        CacheSharingMode::Private => pb::CacheSharingOpt::Private as i32,
                        CacheSharingMode::Locked => pb::CacheSharingOpt::Locked as i32,
                    },
                }),
                secret_opt: None,
                ssh_opt: None,
                result_id: String::new(),
            },
            Mount::Secret { dest, id, uid, gid, mode, optional } => pb::Mount {
                input: -1,
                selector: String::new(),
                dest: dest.clone(),
                output: -1,
                readonly: true,
                mount_type: pb::MountType::Secret as i32,
                tmpfs_opt: None,
                cache_opt: None,
                secret_opt: Some(pb::SecretOpt {
                    id: id.clone(),
                    uid: *uid,
                    gid: *gid,
                    mode: *mode,
                    optional: *optional,
                }),
                ssh_opt: None,
                result_id: String::new(),
            },
            Mount::Ssh { dest, id, uid, gid, mode, optional } => pb::Mount {
                input: -1,
                selector: String::new(),
                dest: dest.clone(),
                output: -1,
                readonly: true,
                mount_type: pb::MountType::Ssh as i32,
                tmpfs_opt: None,
                cache_opt: None,
                secret_opt: None,
                ssh_opt: Some(pb::SshOpt {
                    id: id.clone(),
                    uid: *uid,
                    gid: *gid,
                    mode: *mode,
                    optional: *optional,
                }),
                result_id: String::new(),
            },
            Mount::Tmpfs { dest, size_bytes } => pb::Mount {
                input: -1,
                selector: String::new(),
                dest: dest.clone(),
                output: -1,
                readonly: false,
                mount_type: pb::MountType::Tmpfs as i32,
                tmpfs_opt: Some(pb::TmpfsOpt {
                    size: *size_bytes as i64,
                }),
                cache_opt: None,
                secret_opt: None,
                ssh_opt: None,
                result_id: String::new(),
            },
        };
        out.push(pb_mount);
    }
    out
}

fn file_action_to_pb(action: &FileAction) -> pb::FileAction {
    match action {
        FileAction::Copy {
            src_input_index,
            source_path,
            dest_path,
            mode,
            follow_symlink,
            create_dest_path,
            allow_wildcard,
            include,
            exclude,
            owner,
        } => pb::FileAction {
            input: 0,
            secondary_input: *src_input_index as i64,
            output: 0,
            action: Some(pb::file_action::Action::Copy(pb::FileActionCopy {
                src: source_path.clone(),
                dest: dest_path.clone(),
                owner: chown_to_pb(owner),
                mode: mode.map(|m| m as i32).unwrap_or(-1),
                follow_symlink: *follow_symlink,
                dir_copy_contents: true,
                attempt_unpack_docker_compatibility: false,
                create_dest_path: *create_dest_path,
                allow_wildcard: *allow_wildcard,
                allow_empty_wildcard: false,
                timestamp: -1,
                include_patterns: include.clone(),
                exclude_patterns: exclude.clone(),
            })),
        },
        FileAction::Mkdir { path, mode, make_parents, owner } => pb::FileAction {
            input: 0,
            secondary_input: -1,
            output: 0,
            action: Some(pb::file_action::Action::Mkdir(pb::FileActionMkDir {
                path: path.clone(),
                mode: *mode as i32,
                make_parents: *make_parents,
                owner: chown_to_pb(owner),
                timestamp: -1,
            })),
        },
        FileAction::Mkfile { path, data, mode, owner } => pb::FileAction {
            input: 0,
            secondary_input: -1,
            output: 0,
            action: Some(pb::file_action::Action::Mkfile(pb::FileActionMkFile {
                path: path.clone(),
                mode: *mode as i32,
                data: data.clone(),
                owner: chown_to_pb(owner),
                timestamp: -1,
            })),
        },
        FileAction::Rm { path, allow_not_found, allow_wildcard } => pb::FileAction {
            input: 0,
            secondary_input: -1,
            output: 0,
            action: Some(pb::file_action::Action::Rm(pb::FileActionRm {
                path: path.clone(),
                allow_not_found: *allow_not_found,
                allow_wildcard: *allow_wildcard,
            })),
        },
        FileAction::Symlink { oldpath, newpath } => pb::FileAction {
            input: 0,
            secondary_input: -1,
            output: 0,
            action: Some(pb::file_action::Action::Symlink(pb::FileActionSymlink {
                oldpath: oldpath.clone(),
                newpath: newpath.clone(),
            })),
        },
    }
}

/// Accumulates the three Definition sections while walking the DAG.
struct Walker {
    def: BTreeMap<String, Vec<u8>>,
    metadata: BTreeMap<String, pb::OpMetadata>,
    locations: BTreeMap<String, pb::Locations>,
    visiting: HashMap<*const OpNode, String>,
}

impl Walker {
    fn new() -> Self {
        Walker {
            def: BTreeMap::new(),
            metadata: BTreeMap::new(),
            locations: BTreeMap::new(),
            visiting: HashMap::new(),
        }
    }

    /// Post-order visit: inputs are encoded (and digested) before the node
    /// itself, since the wire form references inputs by digest.
    fn visit(&mut self, node: &Rc<OpNode>, source_index: &BTreeMap<String, i32>) -> Result<String> {
        let ptr = Rc::as_ptr(node);
        if let Some(digest) = self.visiting.get(&ptr) {
            return Ok(digest.clone());
        }

        let mut inputs_pb = Vec::with_capacity(node.inputs().len());
        for (input_node, index) in node.inputs() {
            let digest = self.visit(input_node, source_index)?;
            inputs_pb.push(pb::Input {
                digest,
                index: *index as i64,
            });
        }

        let op_variant = match node.operation() {
            Operation::Source(spec) => pb::op::Op::Source(pb::SourceOp {
                identifier: spec.identifier.clone(),
                attrs: sorted_attrs(&spec.attrs),
            }),
            Operation::Exec(spec) => pb::op::Op::Exec(pb::ExecOp {
                meta: Some(pb::Meta {
                    args: spec.argv.clone(),
                    env: spec.env.clone(),
                    cwd: spec.cwd.clone().unwrap_or_default(),
                    user: spec.user.clone().unwrap_or_default(),
                    proxy_env: None,
                    extra_hosts: Vec::new(),
                    hostname: spec.hostname.clone().unwrap_or_default(),
                    ulimit: Vec::new(),
                    cgroup_parent: String::new(),
                }),
                mounts: mounts_to_pb(&spec.mounts),
                network: match spec.network {
                    NetworkMode::Unset => pb::NetMode::Unset as i32,
                    NetworkMode::Host => pb::NetMode::Host as i32,
                    NetworkMode::None => pb::NetMode::None as i32,
                },
                security: match spec.security {
                    SecurityMode::Sandbox => pb::SecurityMode::Sandbox as i32,
                    SecurityMode::Insecure => pb::SecurityMode::Insecure as i32,
                },
                secretenv: Vec::new(),
            }),
            Operation::File(action) => pb::op::Op::File(pb::FileOp {
                actions: vec![file_action_to_pb(action)],
            }),
            Operation::Merge => pb::op::Op::Merge(pb::MergeOp {
                inputs: (0..node.inputs().len() as i64)
                    .map(|input| pb::MergeInput { input })
                    .collect(),
            }),
            Operation::Diff => pb::op::Op::Diff(pb::DiffOp {
                lower: Some(pb::LowerDiffInput { input: 0 }),
                upper: Some(pb::UpperDiffInput { input: 1 }),
            }),
        };

        let op = pb::Op {
            inputs: inputs_pb,
            platform: platform_to_pb(node.platform()),
            constraints: None,
            op: Some(op_variant),
        };
        let bytes = op.encode_to_vec();
        let digest = digest_of(&bytes);

        self.def.entry(digest.clone()).or_insert(bytes);
        self.metadata.entry(digest.clone()).or_insert_with(|| {
            let meta = node.meta();
            pb::OpMetadata {
                ignore_cache: meta.ignore_cache,
                description: sorted_attrs(&meta.description),
                export_cache: None,
                caps: sorted_caps(&meta.caps),
                progress_group: meta.progress_group.as_ref().map(|pg| pb::ProgressGroup {
                    id: pg.id.clone(),
                    name: pg.name.clone(),
                    weak: pg.weak,
                }),
            }
        });

        let origin = node.origin();
        if let Some(&idx) = source_index.get(&origin.file) {
            let entry = self.locations.entry(digest.clone()).or_insert_with(|| pb::Locations { locations: Vec::new() });
            entry.locations.push(pb::Location {
                source_index: idx,
                ranges: vec![pb::Range {
                    start: Some(pb::Position {
                        line: origin.line as i32,
                        character: 0,
                    }),
                    end: Some(pb::Position {
                        line: origin.line as i32,
                        character: 0,
                    }),
                }],
            });
        }

        self.visiting.insert(ptr, digest.clone());
        Ok(digest)
    }
}

/// Serialize an exported root into a canonical [`pb::Definition`].
///
/// `image_config` is embedded as the `moby.buildkit.image.config`
/// description entry on the root's metadata, JSON-encoded.
pub fn to_definition(root: &Rc<OpNode>, image_config: &ImageConfig, registry: &SourceRegistry) -> Result<pb::Definition> {
    let source_index: BTreeMap<String, i32> = registry
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.to_string(), i as i32))
        .collect();

    let mut walker = Walker::new();
    let root_digest = walker.visit(root, &source_index)?;

    let config_json = image_config
        .to_json()
        .map_err(|e| Error::validation(format!("failed to serialize image config: {e}")))?;
    walker
        .metadata
        .entry(root_digest)
        .and_modify(|meta| {
            meta.description.insert("moby.buildkit.image.config".to_string(), config_json.clone());
        })
        .or_insert_with(|| pb::OpMetadata {
            ignore_cache: false,
            description: BTreeMap::from([("moby.buildkit.image.config".to_string(), config_json)]),
            export_cache: None,
            caps: BTreeMap::new(),
            progress_group: None,
        });

    if walker.def.is_empty() {
        return Err(Error::EmptyDefinition);
    }

    let infos = registry
        .iter()
        .map(|(name, bytes)| pb::SourceInfo {
            filename: name.to_string(),
            data: bytes.to_vec(),
            definition: None,
        })
        .collect();

    Ok(pb::Definition {
        def: walker.def.into_values().collect(),
        metadata: walker.metadata,
        source: Some(pb::Source {
            locations: walker.locations,
            infos,
        }),
    })
}

/// Convenience wrapper over [`to_definition`] taking a [`State`] handle
/// directly, for callers that have not yet unwrapped it to a node.
pub fn state_to_definition(state: &State, image_config: &ImageConfig, registry: &SourceRegistry) -> Result<pb::Definition> {
    to_definition(state.node(), image_config, registry)
}

/// Convenience wrapper building a [`pb::Definition`] straight from an
/// [`crate::eval::EvalResult`], reconstructing a [`SourceRegistry`] from its
/// `source_files` map. Fails with [`Error::NothingExported`] if the script
/// never called `bk.export`.
pub fn from_eval(eval: &crate::eval::EvalResult) -> Result<pb::Definition> {
    let root = eval.state.as_ref().ok_or(Error::NothingExported)?;
    let image_config = eval.image_config.as_ref().ok_or(Error::NothingExported)?;
    let mut registry = SourceRegistry::new();
    for (name, bytes) in &eval.source_files {
        registry.register(name.clone(), bytes.clone());
    }
    to_definition(root, image_config, &registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use crate::source::SourceLocation;

    fn loc() -> SourceLocation {
        SourceLocation { file: "build.lua".into(), line: 1 }
    }

    #[test]
    fn serializing_a_scratch_root_produces_one_entry() {
        let root = ops::scratch(loc());
        let def = to_definition(root.node(), &ImageConfig::default(), &SourceRegistry::new()).unwrap();
        assert_eq!(def.def.len(), 1);
        assert_eq!(def.metadata.len(), 1);
    }

    #[test]
    fn serialization_is_deterministic() {
        let base = ops::image("alpine:3.19", None, loc()).unwrap();
        let ran = ops::run(&base, ops::Command::Shell("true".into()), ops::RunOpts::default(), loc()).unwrap();
        let a = to_definition(ran.node(), &ImageConfig::default(), &SourceRegistry::new()).unwrap();
        let b = to_definition(ran.node(), &ImageConfig::default(), &SourceRegistry::new()).unwrap();
        assert_eq!(a.encode_to_vec(), b.encode_to_vec());
    }

    #[test]
    fn structurally_identical_nodes_collapse_to_one_def_entry() {
        let a = ops::image("alpine:3.19", None, loc()).unwrap();
        let b = ops::image("alpine:3.19", None, loc()).unwrap();
        let merged = ops::merge(&[a, b], loc()).unwrap();
        let def = to_definition(merged.node(), &ImageConfig::default(), &SourceRegistry::new()).unwrap();
        // the two `image` leaves are structurally identical -> one digest,
        // plus the merge node itself.
        assert_eq!(def.def.len(), 2);
    }

    #[test]
    fn empty_definition_is_rejected() {
        // A scratch root always yields at least one op, so this guard is
        // exercised indirectly via `to_definition`'s invariant rather than
        // constructed directly here; covered by `EmptyDefinition`'s Display.
        let err = Error::EmptyDefinition;
        assert_eq!(err.to_string(), "serializer produced an empty definition");
    }

    #[test]
    fn from_eval_rejects_unset_export() {
        let eval = crate::eval::EvalResult {
            state: None,
            image_config: None,
            source_files: indexmap::IndexMap::new(),
        };
        let err = from_eval(&eval).unwrap_err();
        assert_eq!(err.to_string(), "no export call - nothing to build");
    }

    #[test]
    fn from_eval_round_trips_source_files() {
        let root = ops::scratch(loc());
        let mut source_files = indexmap::IndexMap::new();
        source_files.insert("build.lua".to_string(), b"bk.export(bk.scratch())".to_vec());
        let eval = crate::eval::EvalResult {
            state: Some(Rc::clone(root.node())),
            image_config: Some(ImageConfig::default()),
            source_files,
        };
        let def = from_eval(&eval).unwrap();
        assert_eq!(def.source.unwrap().infos.len(), 1);
    }

    #[test]
    fn image_config_is_embedded_on_root_metadata() {
        let root = ops::scratch(loc());
        let mut cfg = ImageConfig::default();
        cfg.labels.insert("org.example".to_string(), "1".to_string());
        let def = to_definition(root.node(), &cfg, &SourceRegistry::new()).unwrap();
        let digest = def.def_first_digest_for_test();
        let meta = def.metadata.get(&digest).unwrap();
        assert!(meta.description.contains_key("moby.buildkit.image.config"));
    }
}

#[cfg(test)]
impl pb::Definition {
    fn def_first_digest_for_test(&self) -> String {
        self.metadata.keys().next().cloned().unwrap()
    }
}
