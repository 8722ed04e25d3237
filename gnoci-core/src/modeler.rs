//! The base OCI data model for a Git repository: a `Modeler` holds the
//! in-memory image of one tagged manifest, accumulates staged mutations,
//! and publishes them transactionally.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use oci_spec::image::{Descriptor, ImageManifest, ImageManifestBuilder, MediaType, SCHEMA_VERSION};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{
    ARTIFACT_TYPE_GIT, CREATED_ANNOTATION_KEY, CREATED_ANNOTATION_VALUE, CommitHash, GitConfig,
    LayerDigest, MEDIA_TYPE_CONFIG_GIT, MEDIA_TYPE_LAYER_PACK, ReferenceClass, ReferenceInfo,
    ReferenceName,
};
use crate::traits::{GraphTarget, ReferrerUpdater, Repository};

/// The in-memory image of one tagged Git manifest. Follows
/// `Empty → Fetched → Mutated* → Published`; a `Modeler` is not reused
/// after `push` succeeds.
pub struct Modeler {
    reference: String,
    man_desc: Option<Descriptor>,
    layers: Vec<Descriptor>,
    cfg: GitConfig,
    refs_by_layer: HashMap<LayerDigest, Vec<CommitHash>>,
    new_packs: Vec<Descriptor>,
    fetched: bool,
    published: bool,
}

impl Modeler {
    pub fn new(reference: impl Into<String>) -> Modeler {
        Modeler {
            reference: reference.into(),
            man_desc: None,
            layers: Vec::new(),
            cfg: GitConfig::default(),
            refs_by_layer: HashMap::new(),
            new_packs: Vec::new(),
            fetched: false,
            published: false,
        }
    }

    pub fn config(&self) -> &GitConfig {
        &self.cfg
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.layers
    }

    pub fn manifest_descriptor(&self) -> Option<&Descriptor> {
        self.man_desc.as_ref()
    }

    /// Resolve the tag, fetch and decode the manifest and config. Fails
    /// with `ManifestNotFound` if the tag does not exist. Idempotent once
    /// fetched.
    pub async fn fetch(&mut self, target: &dyn GraphTarget, cancel: &CancellationToken) -> Result<Descriptor> {
        if self.fetched {
            return Ok(self.man_desc.clone().expect("fetched implies man_desc is set"));
        }
        let desc = target
            .resolve(&self.reference, cancel)
            .await
            .map_err(Error::Registry)?
            .ok_or_else(|| Error::ManifestNotFound {
                reference: self.reference.clone(),
            })?;
        self.load_from(target, desc.clone(), cancel).await?;
        self.fetched = true;
        Ok(desc)
    }

    /// As `fetch`, but initializes a truly empty manifest/config instead
    /// of failing when the tag does not exist yet. Returns `None` when a
    /// fresh model was initialized.
    pub async fn fetch_or_default(
        &mut self,
        target: &dyn GraphTarget,
        cancel: &CancellationToken,
    ) -> Result<Option<Descriptor>> {
        if self.fetched {
            return Ok(self.man_desc.clone());
        }
        match target.resolve(&self.reference, cancel).await.map_err(Error::Registry)? {
            Some(desc) => {
                self.load_from(target, desc.clone(), cancel).await?;
                self.fetched = true;
                Ok(Some(desc))
            }
            None => {
                self.cfg = GitConfig::default();
                self.layers = Vec::new();
                self.man_desc = None;
                self.refs_by_layer = HashMap::new();
                self.fetched = true;
                Ok(None)
            }
        }
    }

    async fn load_from(&mut self, target: &dyn GraphTarget, desc: Descriptor, cancel: &CancellationToken) -> Result<()> {
        let bytes = target.fetch_bytes(&desc, cancel).await.map_err(Error::Registry)?;
        let manifest: ImageManifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Registry(anyhow::anyhow!("decoding git manifest: {e}")))?;
        let cfg_bytes = target
            .fetch_bytes(manifest.config(), cancel)
            .await
            .map_err(Error::Registry)?;
        let cfg: GitConfig = serde_json::from_slice(&cfg_bytes)
            .map_err(|e| Error::Registry(anyhow::anyhow!("decoding git config: {e}")))?;
        self.man_desc = Some(desc);
        self.layers = manifest.layers().clone();
        self.cfg = cfg;
        self.rebuild_refs_by_layer();
        Ok(())
    }

    /// Rebuilds `refs_by_layer` from `cfg`, which is never patched in place.
    fn rebuild_refs_by_layer(&mut self) {
        self.refs_by_layer.clear();
        for (_, info) in self.cfg.all_refs() {
            self.refs_by_layer
                .entry(info.layer.clone())
                .or_default()
                .push(info.commit.clone());
        }
    }

    pub async fn fetch_layer(
        &self,
        target: &dyn GraphTarget,
        digest: &LayerDigest,
        sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let desc = self
            .layers
            .iter()
            .find(|d| d.digest() == digest.as_str())
            .ok_or_else(|| Error::LayerNotInManifest {
                digest: digest.to_string(),
            })?;
        target.fetch_stream(desc, sink, cancel).await.map_err(Error::Registry)
    }

    /// Push a new packfile layer and, for each supplied reference, record
    /// its new `(commit, layer)`. The layer is kept even if a reference is
    /// of an unsupported class — only that ref's update is rejected.
    pub async fn add_pack(
        &mut self,
        target: &dyn GraphTarget,
        path: &Path,
        refs: &[(ReferenceName, CommitHash)],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let desc = target
            .push_blob(MEDIA_TYPE_LAYER_PACK, path, cancel)
            .await
            .map_err(Error::Registry)?;
        let digest = LayerDigest::parse(desc.digest().to_string())
            .map_err(|e| Error::Registry(e))?;
        self.layers.push(desc.clone());
        self.new_packs.push(desc);

        let mut first_unsupported = None;
        for (name, commit) in refs {
            let info = ReferenceInfo {
                commit: commit.clone(),
                layer: digest.clone(),
            };
            match name.class() {
                ReferenceClass::Head => {
                    self.cfg.heads.insert(name.as_str().to_string(), info);
                }
                ReferenceClass::Tag => {
                    self.cfg.tags.insert(name.as_str().to_string(), info);
                }
                ReferenceClass::Other => {
                    if first_unsupported.is_none() {
                        first_unsupported = Some(name.as_str().to_string());
                    }
                }
            }
        }
        if let Some(name) = first_unsupported {
            return Err(Error::UnsupportedReferenceType { name });
        }
        Ok(())
    }

    pub fn update_ref(&mut self, name: &ReferenceName, commit: CommitHash, layer: &LayerDigest) -> Result<()> {
        if !self.layers.iter().any(|d| d.digest() == layer.as_str()) {
            return Err(Error::LayerNotInManifest {
                digest: layer.to_string(),
            });
        }
        let info = ReferenceInfo {
            commit,
            layer: layer.clone(),
        };
        match name.class() {
            ReferenceClass::Head => {
                self.cfg.heads.insert(name.as_str().to_string(), info);
                Ok(())
            }
            ReferenceClass::Tag => {
                self.cfg.tags.insert(name.as_str().to_string(), info);
                Ok(())
            }
            ReferenceClass::Other => Err(Error::UnsupportedReferenceType {
                name: name.as_str().to_string(),
            }),
        }
    }

    /// Idempotent: removing an absent reference succeeds silently.
    pub fn delete_ref(&mut self, name: &ReferenceName) -> Result<()> {
        match name.class() {
            ReferenceClass::Head => {
                self.cfg.heads.remove(name.as_str());
                Ok(())
            }
            ReferenceClass::Tag => {
                self.cfg.tags.remove(name.as_str());
                Ok(())
            }
            ReferenceClass::Other => Err(Error::UnsupportedReferenceType {
                name: name.as_str().to_string(),
            }),
        }
    }

    pub fn resolve_ref(&self, name: &ReferenceName) -> Result<ReferenceInfo> {
        if name.class() == ReferenceClass::Other {
            return Err(Error::UnsupportedReferenceType {
                name: name.as_str().to_string(),
            });
        }
        self.cfg.get(name).cloned().ok_or_else(|| Error::ReferenceNotFound {
            name: name.as_str().to_string(),
        })
    }

    pub fn head_refs(&self) -> &BTreeMap<String, ReferenceInfo> {
        &self.cfg.heads
    }

    pub fn tag_refs(&self) -> &BTreeMap<String, ReferenceInfo> {
        &self.cfg.tags
    }

    /// Walk ancestors of every indexed tip, per layer, looking for
    /// `commit`. Returns the first layer it is found in, or `None`.
    pub fn commit_exists(&self, repo: &dyn Repository, commit: &CommitHash) -> anyhow::Result<Option<LayerDigest>> {
        for (layer, tips) in &self.refs_by_layer {
            for tip in tips {
                if repo.is_ancestor(commit.clone(), tip.clone())? {
                    return Ok(Some(layer.clone()));
                }
            }
        }
        Ok(None)
    }

    /// The transactional publish: config, then manifest, then tag, then
    /// referrer cascades.
    pub async fn push(
        &mut self,
        target: &dyn GraphTarget,
        updaters: &mut [&mut dyn ReferrerUpdater],
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        assert!(!self.published, "Modeler reused after push");
        self.rebuild_refs_by_layer();

        let cfg_bytes = serde_json::to_vec(&self.cfg).expect("GitConfig always serializes");
        let cfg_desc = target
            .push_bytes(MEDIA_TYPE_CONFIG_GIT, &cfg_bytes, cancel)
            .await
            .map_err(Error::Registry)?;

        let mut annotations = HashMap::new();
        annotations.insert(CREATED_ANNOTATION_KEY.to_string(), CREATED_ANNOTATION_VALUE.to_string());
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .artifact_type(MediaType::Other(ARTIFACT_TYPE_GIT.to_string()))
            .config(cfg_desc)
            .layers(self.layers.clone())
            .annotations(annotations)
            .build()
            .map_err(|e| Error::Registry(anyhow::anyhow!("building git manifest: {e}")))?;

        let man_desc = target.push_manifest(&manifest, cancel).await.map_err(Error::Registry)?;
        target
            .tag(&man_desc, &self.reference, cancel)
            .await
            .map_err(Error::Registry)?;

        for updater in updaters.iter_mut() {
            updater.update(target, &man_desc, cancel).await.map_err(Error::Registry)?;
        }

        self.man_desc = Some(man_desc.clone());
        self.published = true;
        Ok(man_desc)
    }
}
