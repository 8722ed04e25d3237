//! The OCI-artifact-as-git data model: reference names, commit hashes, layer
//! digests, the git config blob, and the two manifest shapes.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Artifact type of the git manifest (`man.artifactType`).
pub const ARTIFACT_TYPE_GIT: &str = "application/vnd.act3-ai.gnoci.manifest.git";
/// Artifact type of the LFS side-car manifest.
pub const ARTIFACT_TYPE_LFS: &str = "application/vnd.act3-ai.gnoci.manifest.lfs";
/// Media type of the git config blob.
pub const MEDIA_TYPE_CONFIG_GIT: &str = "application/vnd.act3-ai.gnoci.config.git+json";
/// Media type of a packfile layer.
pub const MEDIA_TYPE_LAYER_PACK: &str = "application/vnd.act3-ai.gnoci.layer.pack";
/// Media type of an LFS blob layer.
pub const MEDIA_TYPE_LAYER_LFS: &str = "application/vnd.act3-ai.gnoci.layer.lfs";
/// The standard OCI "no config" sentinel used for the LFS manifest's
/// config descriptor.
pub const MEDIA_TYPE_EMPTY_CONFIG: &str = "application/vnd.oci.empty.v1+json";
/// Body of the empty config blob referenced by `MEDIA_TYPE_EMPTY_CONFIG`.
pub const EMPTY_CONFIG_BODY: &[u8] = b"{}";

/// Fixed `created` annotation applied to both manifests so that identical
/// content always produces an identical manifest digest.
pub const CREATED_ANNOTATION_KEY: &str = "org.opencontainers.image.created";
pub const CREATED_ANNOTATION_VALUE: &str = "1970-01-01T00:00:00Z";

/// A git reference name. Only `refs/heads/*` and `refs/tags/*` are
/// supported; anything else is rejected with `UnsupportedReferenceType` by
/// every call site that would otherwise insert it into a `GitConfig`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceName(String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceClass {
    Head,
    Tag,
    Other,
}

impl ReferenceName {
    pub fn new(name: impl Into<String>) -> ReferenceName {
        ReferenceName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn class(&self) -> ReferenceClass {
        if self.0.starts_with("refs/heads/") {
            ReferenceClass::Head
        } else if self.0.starts_with("refs/tags/") {
            ReferenceClass::Tag
        } else {
            ReferenceClass::Other
        }
    }
}

impl fmt::Display for ReferenceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReferenceName {
    fn from(s: &str) -> ReferenceName {
        ReferenceName(s.to_string())
    }
}

/// The commit a reference points at. The all-zero hash is the sentinel
/// meaning "no commit" used by the comparer when a remote ref does not
/// exist yet.
pub type CommitHash = gix_hash::ObjectId;

pub fn null_commit(kind: gix_hash::Kind) -> CommitHash {
    gix_hash::ObjectId::null(kind)
}

/// An OCI content digest (`<algo>:<hex>`), uniquely identifying an
/// immutable blob.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerDigest(String);

impl LayerDigest {
    pub fn parse(digest: impl Into<String>) -> anyhow::Result<LayerDigest> {
        let digest = digest.into();
        let (algo, hex) = digest
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("digest {:?} missing algo prefix", &digest))?;
        if algo.is_empty() || hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            anyhow::bail!("digest {:?} is not well-formed", &digest);
        }
        Ok(LayerDigest(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for LayerDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for LayerDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<LayerDigest, D::Error> {
        let s = String::deserialize(deserializer)?;
        LayerDigest::parse(s).map_err(D::Error::custom)
    }
}

fn serialize_commit<S: Serializer>(commit: &CommitHash, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&commit.to_string())
}

fn deserialize_commit<'de, D: Deserializer<'de>>(deserializer: D) -> Result<CommitHash, D::Error> {
    let s = String::deserialize(deserializer)?;
    gix_hash::ObjectId::from_hex(s.as_bytes()).map_err(D::Error::custom)
}

/// `(Commit, Layer)` — the commit a reference currently points at, and the
/// packfile layer within which that commit's objects are stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    #[serde(serialize_with = "serialize_commit", deserialize_with = "deserialize_commit")]
    pub commit: CommitHash,
    pub layer: LayerDigest,
}

/// The decoded git config blob: two maps keyed by reference name.
/// `BTreeMap` keeps JSON serialization deterministic so the config blob's
/// digest — and hence the manifest's digest — is reproducible for identical
/// content.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub heads: BTreeMap<String, ReferenceInfo>,
    #[serde(default)]
    pub tags: BTreeMap<String, ReferenceInfo>,
}

impl GitConfig {
    pub fn get(&self, name: &ReferenceName) -> Option<&ReferenceInfo> {
        match name.class() {
            ReferenceClass::Head => self.heads.get(name.as_str()),
            ReferenceClass::Tag => self.tags.get(name.as_str()),
            ReferenceClass::Other => None,
        }
    }

    pub fn all_refs(&self) -> impl Iterator<Item = (&str, &ReferenceInfo)> {
        self.heads
            .iter()
            .chain(self.tags.iter())
            .map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_name_classifies_heads_tags_and_other() {
        assert_eq!(ReferenceName::new("refs/heads/main").class(), ReferenceClass::Head);
        assert_eq!(ReferenceName::new("refs/tags/v1").class(), ReferenceClass::Tag);
        assert_eq!(ReferenceName::new("refs/notes/commits").class(), ReferenceClass::Other);
    }

    #[test]
    fn layer_digest_parse_rejects_missing_algo() {
        assert!(LayerDigest::parse("deadbeef").is_err());
    }

    #[test]
    fn layer_digest_parse_rejects_non_hex() {
        assert!(LayerDigest::parse("sha256:not-hex!!").is_err());
    }

    #[test]
    fn layer_digest_parse_accepts_well_formed() {
        let d = LayerDigest::parse("sha256:deadbeef").expect("parse");
        assert_eq!(d.as_str(), "sha256:deadbeef");
    }

    #[test]
    fn git_config_round_trips_through_json_with_empty_maps_as_braces() {
        let cfg = GitConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert_eq!(json, r#"{"heads":{},"tags":{}}"#);
        let back: GitConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }

    #[test]
    fn git_config_get_routes_by_reference_class() {
        let mut cfg = GitConfig::default();
        let info = ReferenceInfo {
            commit: null_commit(gix_hash::Kind::Sha1),
            layer: LayerDigest::parse("sha256:aa").unwrap(),
        };
        cfg.heads.insert("refs/heads/main".to_string(), info.clone());
        assert_eq!(cfg.get(&ReferenceName::new("refs/heads/main")), Some(&info));
        assert_eq!(cfg.get(&ReferenceName::new("refs/tags/main")), None);
        assert_eq!(cfg.get(&ReferenceName::new("refs/notes/main")), None);
    }
}
