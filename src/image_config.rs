//! [`ImageConfig`]: the image manifest annotations collected at export.
//!
//! Field names and casing follow the OCI image config `config` object
//! (see `containers-oci-spec-rs`'s `image::config::Config`), since the
//! serialized form of this struct is embedded verbatim as the
//! `moby.buildkit.image.config` description entry on the exported root.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Image manifest annotations collected by `bk.export`'s options table.
///
/// Serializes as the OCI `config` object plus the top-level `os`/
/// `architecture`/`variant` platform fields the solver reads alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// The target operating system.
    pub os: String,
    /// The target CPU architecture.
    pub architecture: String,
    /// The target architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// The entrypoint argv, if overridden.
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// The default command argv, if overridden.
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// `KEY=VALUE` environment entries, in declaration order.
    #[serde(rename = "Env", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// The default working directory.
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// The default user.
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Exposed ports, e.g. `"8080/tcp"`, in declaration order, unique.
    #[serde(
        rename = "ExposedPorts",
        serialize_with = "serialize_exposed_ports",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub exposed_ports: IndexMap<String, ()>,
    /// Image labels. Last write wins on duplicate keys, per upstream's own
    /// map-based merge semantics (see `DESIGN.md`).
    #[serde(rename = "Labels", skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
            entrypoint: None,
            cmd: None,
            env: Vec::new(),
            workdir: None,
            user: None,
            exposed_ports: IndexMap::new(),
            labels: IndexMap::new(),
        }
    }
}

fn serialize_exposed_ports<S>(ports: &IndexMap<String, ()>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(ports.len()))?;
    for key in ports.keys() {
        map.serialize_entry(key, &serde_json::Map::new())?;
    }
    map.end()
}

impl ImageConfig {
    /// Serialize to the JSON blob stored under the
    /// `moby.buildkit.image.config` description key.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ImageConfig::default();
        assert_eq!(cfg.os, "linux");
        assert_eq!(cfg.architecture, "amd64");
        assert!(cfg.env.is_empty());
        assert!(cfg.exposed_ports.is_empty());
        assert!(cfg.labels.is_empty());
    }

    #[test]
    fn serializes_exposed_ports_as_a_map() {
        let mut cfg = ImageConfig::default();
        cfg.exposed_ports.insert("8080/tcp".to_string(), ());
        let json = cfg.to_json().unwrap();
        assert!(json.contains("\"ExposedPorts\":{\"8080/tcp\":{}}"));
    }

    #[test]
    fn last_write_wins_on_duplicate_labels() {
        let mut cfg = ImageConfig::default();
        cfg.labels.insert("foo".to_string(), "one".to_string());
        cfg.labels.insert("foo".to_string(), "two".to_string());
        assert_eq!(cfg.labels.get("foo"), Some(&"two".to_string()));
        assert_eq!(cfg.labels.len(), 1);
    }
}
