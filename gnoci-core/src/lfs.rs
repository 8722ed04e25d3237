//! The LFS side-car data model: a sibling manifest linked to the Git
//! manifest via the OCI referrers API, holding deduplicated LFS blob
//! layers.

use std::ops::{Deref, DerefMut};
use std::path::Path;

use oci_spec::image::{Descriptor, ImageManifestBuilder, MediaType, SCHEMA_VERSION};
use sha2::{Digest as _, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{
    ARTIFACT_TYPE_LFS, CREATED_ANNOTATION_KEY, CREATED_ANNOTATION_VALUE, EMPTY_CONFIG_BODY,
    MEDIA_TYPE_EMPTY_CONFIG, MEDIA_TYPE_LAYER_LFS,
};
use crate::modeler::Modeler;
use crate::traits::GraphTarget;

/// Wraps a `Modeler`, adding the LFS side-car manifest. Dereferences to
/// the inner `Modeler` so base operations (`resolve_ref`, `add_pack`, ...)
/// are called directly on an `LFSModeler`.
pub struct LFSModeler {
    modeler: Modeler,
    lfs_man_desc: Option<Descriptor>,
    lfs_layers: Vec<Descriptor>,
    lfs_fetched: bool,
}

impl Deref for LFSModeler {
    type Target = Modeler;
    fn deref(&self) -> &Modeler {
        &self.modeler
    }
}

impl DerefMut for LFSModeler {
    fn deref_mut(&mut self) -> &mut Modeler {
        &mut self.modeler
    }
}

impl LFSModeler {
    pub fn new(modeler: Modeler) -> LFSModeler {
        LFSModeler {
            modeler,
            lfs_man_desc: None,
            lfs_layers: Vec::new(),
            lfs_fetched: false,
        }
    }

    pub fn into_inner(self) -> Modeler {
        self.modeler
    }

    pub fn lfs_layers(&self) -> &[Descriptor] {
        &self.lfs_layers
    }

    /// Query the referrers of `subject` (the Git manifest) for its LFS
    /// side-car. `Ok(true)` if one was found and loaded. Expects exactly
    /// zero or one referrer of the LFS artifact type, so an unrelated
    /// referrer cohabiting the same subject never trips this up.
    pub async fn fetch_lfs(
        &mut self,
        target: &dyn GraphTarget,
        subject: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let referrers = target
            .referrers(subject, Some(ARTIFACT_TYPE_LFS), cancel)
            .await
            .map_err(Error::Registry)?;
        match referrers.len() {
            0 => Ok(false),
            1 => {
                let desc = referrers.into_iter().next().expect("len checked above");
                let bytes = target.fetch_bytes(&desc, cancel).await.map_err(Error::Registry)?;
                let manifest: oci_spec::image::ImageManifest = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Registry(anyhow::anyhow!("decoding lfs manifest: {e}")))?;
                self.lfs_layers = manifest.layers().clone();
                self.lfs_man_desc = Some(desc);
                self.lfs_fetched = true;
                Ok(true)
            }
            n => Err(Error::MultipleLfsReferrers { count: n }),
        }
    }

    /// As `fetch_lfs`, but a missing side-car initializes an empty one
    /// instead of being reported to the caller as absent.
    pub async fn fetch_lfs_or_default(
        &mut self,
        target: &dyn GraphTarget,
        subject: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.fetch_lfs(target, subject, cancel).await? {
            self.lfs_layers = Vec::new();
            self.lfs_man_desc = None;
            self.lfs_fetched = true;
        }
        Ok(())
    }

    pub async fn fetch_lfs_layer(
        &self,
        target: &dyn GraphTarget,
        digest: &crate::model::LayerDigest,
        sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let desc = self
            .lfs_layers
            .iter()
            .find(|d| d.digest() == digest.as_str())
            .ok_or_else(|| Error::LayerNotInManifest {
                digest: digest.to_string(),
            })?;
        target.fetch_stream(desc, sink, cancel).await.map_err(Error::Registry)
    }

    /// Stage `path` as an LFS blob layer, deduplicating by content digest.
    /// A digest collision with a different size is `Corruption`.
    pub async fn push_lfs_file(
        &mut self,
        target: &dyn GraphTarget,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Registry(anyhow::anyhow!(e).context(format!("reading {}", path.display()))))?;
        let digest = format!("sha256:{:x}", Sha256::digest(&data));
        let size = data.len() as u64;

        if let Some(existing) = self.lfs_layers.iter().find(|d| d.digest() == &digest) {
            if existing.size() as u64 != size {
                return Err(Error::Corruption {
                    digest,
                    expected: existing.size() as u64,
                    actual: size,
                });
            }
            return Ok(existing.clone());
        }

        let desc = target
            .push_bytes(MEDIA_TYPE_LAYER_LFS, &data, cancel)
            .await
            .map_err(Error::Registry)?;
        self.lfs_layers.push(desc.clone());
        Ok(desc)
    }

    /// Delete the previous LFS referrer (best-effort; missing/unsupported
    /// deletion is tolerated) and publish a fresh LFS manifest whose
    /// subject is `subject`.
    pub async fn push_lfs_manifest(
        &mut self,
        target: &dyn GraphTarget,
        subject: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        if let Some(old) = self.lfs_man_desc.take() {
            let _ = target.delete_manifest(&old, cancel).await;
        }

        let empty_cfg = target
            .push_bytes(MEDIA_TYPE_EMPTY_CONFIG, EMPTY_CONFIG_BODY, cancel)
            .await
            .map_err(Error::Registry)?;

        let mut annotations = std::collections::HashMap::new();
        annotations.insert(CREATED_ANNOTATION_KEY.to_string(), CREATED_ANNOTATION_VALUE.to_string());

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .artifact_type(MediaType::Other(ARTIFACT_TYPE_LFS.to_string()))
            .config(empty_cfg)
            .layers(self.lfs_layers.clone())
            .subject(subject.clone())
            .annotations(annotations)
            .build()
            .map_err(|e| Error::Registry(anyhow::anyhow!("building lfs manifest: {e}")))?;

        let desc = target.push_manifest(&manifest, cancel).await.map_err(Error::Registry)?;
        self.lfs_man_desc = Some(desc.clone());
        Ok(desc)
    }
}
