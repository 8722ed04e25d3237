//! In-memory `GraphTarget` fake used by unit tests throughout this crate,
//! paired with an in-memory commit graph standing in for a real
//! `git2`-backed `Repository`. Not part of the public API; compiled only
//! under `#[cfg(test)]`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageManifest, MediaType};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::model::CommitHash;
use crate::traits::{GitObjectId, GraphTarget, Repository};

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

fn descriptor_for(media_type: &str, data: &[u8], artifact_type: Option<&str>) -> Descriptor {
    let mut builder = DescriptorBuilder::default();
    builder
        .media_type(MediaType::Other(media_type.to_string()))
        .digest(digest_of(data))
        .size(data.len() as i64);
    if let Some(at) = artifact_type {
        builder.artifact_type(MediaType::Other(at.to_string()));
    }
    builder.build().expect("descriptor always builds in tests")
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    /// digest -> artifact type of the manifest pushed at that digest, if any
    manifest_artifact_types: HashMap<String, String>,
    /// subject digest -> referrer descriptors
    referrers: HashMap<String, Vec<Descriptor>>,
    tags: HashMap<String, Descriptor>,
    deletable: bool,
}

/// A registry that keeps everything in memory. `deletable(false)` can
/// simulate a registry that does not support manifest deletion.
#[derive(Clone)]
pub struct FakeGraphTarget {
    inner: Arc<Mutex<Inner>>,
}

impl FakeGraphTarget {
    pub fn new() -> FakeGraphTarget {
        FakeGraphTarget {
            inner: Arc::new(Mutex::new(Inner {
                deletable: true,
                ..Inner::default()
            })),
        }
    }

    pub fn without_delete_support() -> FakeGraphTarget {
        let target = FakeGraphTarget::new();
        target.inner.lock().unwrap().deletable = false;
        target
    }

    pub fn resolved_tag(&self, reference: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .tags
            .get(reference)
            .map(|d| d.digest().to_string())
    }

    pub fn blob_count(&self) -> usize {
        self.inner.lock().unwrap().blobs.len()
    }
}

#[async_trait]
impl GraphTarget for FakeGraphTarget {
    async fn resolve(&self, reference: &str, _cancel: &CancellationToken) -> anyhow::Result<Option<Descriptor>> {
        Ok(self.inner.lock().unwrap().tags.get(reference).cloned())
    }

    async fn fetch_bytes(&self, descriptor: &Descriptor, _cancel: &CancellationToken) -> anyhow::Result<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .blobs
            .get(descriptor.digest())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no blob for digest {}", descriptor.digest()))
    }

    async fn fetch_stream(
        &self,
        descriptor: &Descriptor,
        sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let bytes = self.fetch_bytes(descriptor, cancel).await?;
        sink.write_all(&bytes).await?;
        Ok(())
    }

    async fn push_blob(
        &self,
        media_type: &str,
        path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Descriptor> {
        let mut data = Vec::new();
        tokio::fs::File::open(path).await?.read_to_end(&mut data).await?;
        self.push_bytes(media_type, &data, cancel).await
    }

    async fn push_bytes(&self, media_type: &str, data: &[u8], _cancel: &CancellationToken) -> anyhow::Result<Descriptor> {
        let desc = descriptor_for(media_type, data, None);
        self.inner
            .lock()
            .unwrap()
            .blobs
            .insert(desc.digest().to_string(), data.to_vec());
        Ok(desc)
    }

    async fn push_manifest(&self, manifest: &ImageManifest, _cancel: &CancellationToken) -> anyhow::Result<Descriptor> {
        let bytes = serde_json::to_vec(manifest)?;
        let desc = descriptor_for(
            "application/vnd.oci.image.manifest.v1+json",
            &bytes,
            manifest.artifact_type().as_ref().and_then(|m| match m {
                MediaType::Other(s) => Some(s.as_str()),
                _ => None,
            }),
        );
        let mut inner = self.inner.lock().unwrap();
        inner.blobs.insert(desc.digest().to_string(), bytes);
        if let Some(MediaType::Other(at)) = manifest.artifact_type() {
            inner.manifest_artifact_types.insert(desc.digest().to_string(), at.clone());
        }
        if let Some(subject) = manifest.subject() {
            inner
                .referrers
                .entry(subject.digest().to_string())
                .or_default()
                .push(desc.clone());
        }
        Ok(desc)
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.inner
            .lock()
            .unwrap()
            .tags
            .insert(reference.to_string(), descriptor.clone());
        Ok(())
    }

    async fn delete_manifest(&self, descriptor: &Descriptor, _cancel: &CancellationToken) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.deletable {
            return Ok(false);
        }
        inner.blobs.remove(descriptor.digest());
        for referrers in inner.referrers.values_mut() {
            referrers.retain(|d| d.digest() != descriptor.digest());
        }
        Ok(true)
    }

    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Descriptor>> {
        let inner = self.inner.lock().unwrap();
        let all = inner.referrers.get(subject.digest()).cloned().unwrap_or_default();
        Ok(match artifact_type {
            None => all,
            Some(at) => all
                .into_iter()
                .filter(|d| inner.manifest_artifact_types.get(d.digest()).map(String::as_str) == Some(at))
                .collect(),
        })
    }
}

/// An in-memory commit graph used to exercise the comparer and push
/// reconciliation engine without a real git object database. Parents are
/// recorded explicitly; `is_ancestor`/`enumerate_reachable` walk them.
#[derive(Default)]
pub struct FakeRepository {
    parents: HashMap<CommitHash, Vec<CommitHash>>,
    local_refs: HashMap<String, CommitHash>,
}

impl FakeRepository {
    pub fn new() -> FakeRepository {
        FakeRepository::default()
    }

    pub fn add_commit(&mut self, commit: CommitHash, parents: Vec<CommitHash>) {
        self.parents.insert(commit, parents);
    }

    pub fn set_local_ref(&mut self, name: &str, commit: CommitHash) {
        self.local_refs.insert(name.to_string(), commit);
    }

    fn ancestors_of(&self, start: &CommitHash) -> HashMap<CommitHash, ()> {
        let mut seen = HashMap::new();
        let mut stack = vec![start.clone()];
        while let Some(commit) = stack.pop() {
            if seen.insert(commit.clone(), ()).is_some() {
                continue;
            }
            if let Some(parents) = self.parents.get(&commit) {
                stack.extend(parents.iter().cloned());
            }
        }
        seen
    }
}

impl Repository for FakeRepository {
    fn resolve_local_ref(&self, short_name: &str) -> anyhow::Result<Option<CommitHash>> {
        Ok(self.local_refs.get(short_name).cloned())
    }

    fn is_ancestor(&self, ancestor: CommitHash, descendant: CommitHash) -> anyhow::Result<bool> {
        Ok(self.ancestors_of(&descendant).contains_key(&ancestor))
    }

    fn enumerate_reachable(&self, tips: &[CommitHash], exclude: &[CommitHash]) -> anyhow::Result<Vec<GitObjectId>> {
        let mut excluded = HashMap::new();
        for e in exclude {
            excluded.extend(self.ancestors_of(e));
        }
        let mut out = Vec::new();
        let mut seen = HashMap::new();
        for tip in tips {
            for commit in self.ancestors_of(tip).into_keys() {
                if excluded.contains_key(&commit) || seen.insert(commit.clone(), ()).is_some() {
                    continue;
                }
                out.push(GitObjectId(commit));
            }
        }
        Ok(out)
    }

    fn write_pack(&self, objects: &[GitObjectId], dest_dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
        let mut bytes = Vec::new();
        for obj in objects {
            bytes.extend_from_slice(obj.0.as_slice());
        }
        let digest = digest_of(&bytes);
        let path = dest_dir.join(format!("pack-{}.pack", digest.replace(':', "-")));
        std::fs::write(&path, &bytes)?;
        Ok(path)
    }
}
