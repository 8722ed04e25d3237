//! `gnoci_core::GraphTarget` backed by a real OCI registry, via `oci-client`.
//! Converts between `oci_spec`'s manifest/descriptor types (what the core
//! speaks) and `oci-client`'s own types (what the wire client speaks).

use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use gnoci_core::GraphTarget;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use oci_spec::image::{Descriptor, DescriptorBuilder, ImageManifest, MediaType};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Races `fut` against `cancel` so a registry round-trip is abandoned
/// promptly instead of being awaited to completion after the caller has
/// already given up on it.
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(anyhow::anyhow!("operation cancelled")),
        res = fut => res,
    }
}

pub struct OciGraphTarget {
    client: Client,
    auth: RegistryAuth,
    registry: String,
    repository: String,
}

fn media_type_str(media_type: &Option<MediaType>) -> String {
    match media_type {
        Some(MediaType::Other(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => OCI_MANIFEST_MEDIA_TYPE.to_string(),
    }
}

fn descriptor_to_client(desc: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: media_type_str(&Some(desc.media_type().clone())),
        digest: desc.digest().to_string(),
        size: desc.size(),
        urls: None,
        annotations: desc
            .annotations()
            .clone()
            .map(|m| m.into_iter().collect()),
    }
}

fn descriptor_from_client(desc: &OciDescriptor) -> Result<Descriptor> {
    let mut builder = DescriptorBuilder::default();
    builder
        .media_type(MediaType::Other(desc.media_type.clone()))
        .digest(desc.digest.clone())
        .size(desc.size);
    if let Some(annotations) = &desc.annotations {
        builder.annotations(annotations.clone());
    }
    builder.build().context("build descriptor from oci-client descriptor")
}

fn manifest_to_client(manifest: &ImageManifest) -> Result<OciImageManifest> {
    Ok(OciImageManifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
        artifact_type: manifest.artifact_type().as_ref().map(|m| media_type_str(&Some(m.clone()))),
        config: descriptor_to_client(manifest.config()),
        layers: manifest.layers().iter().map(descriptor_to_client).collect(),
        subject: manifest.subject().as_ref().map(descriptor_to_client),
        annotations: manifest.annotations().clone().map(|m| m.into_iter().collect()),
    })
}

fn looks_like_not_found(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("not found") || msg.contains("404") || msg.contains("manifest_unknown")
}

impl OciGraphTarget {
    pub fn new(registry: &str, repository: &str, insecure: bool) -> Result<OciGraphTarget> {
        let protocol = if insecure { ClientProtocol::Http } else { ClientProtocol::Https };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        let client = Client::new(config);
        Ok(OciGraphTarget {
            client,
            auth: RegistryAuth::Anonymous,
            registry: registry.to_string(),
            repository: repository.to_string(),
        })
    }

    fn named_reference(&self, reference: &str) -> Reference {
        if let Some(digest) = reference.strip_prefix('@') {
            Reference::with_digest(self.registry.clone(), self.repository.clone(), digest.to_string())
        } else {
            Reference::with_tag(self.registry.clone(), self.repository.clone(), reference.to_string())
        }
    }

    fn digest_reference(&self, digest: &str) -> Reference {
        Reference::with_digest(self.registry.clone(), self.repository.clone(), digest.to_string())
    }
}

#[async_trait]
impl GraphTarget for OciGraphTarget {
    async fn resolve(&self, reference: &str, cancel: &CancellationToken) -> Result<Option<Descriptor>> {
        let accepted = [OCI_MANIFEST_MEDIA_TYPE];
        let named = self.named_reference(reference);
        let pulled = cancellable(
            cancel,
            async { self.client.pull_manifest_raw(&named, &self.auth, &accepted).await.map_err(|e| anyhow::anyhow!(e)) },
        )
        .await;
        match pulled {
            Ok((bytes, digest)) => {
                let manifest: OciImageManifest =
                    serde_json::from_slice(&bytes).context("decoding manifest to inspect media/artifact type")?;
                let mut builder = DescriptorBuilder::default();
                builder
                    .media_type(MediaType::Other(
                        manifest.media_type.clone().unwrap_or_else(|| OCI_MANIFEST_MEDIA_TYPE.to_string()),
                    ))
                    .digest(digest)
                    .size(bytes.len() as i64);
                if let Some(at) = &manifest.artifact_type {
                    builder.artifact_type(MediaType::Other(at.clone()));
                }
                Ok(Some(builder.build().context("build resolved manifest descriptor")?))
            }
            Err(err) => {
                if looks_like_not_found(&err) {
                    Ok(None)
                } else {
                    Err(err).context("pull manifest")
                }
            }
        }
    }

    async fn fetch_bytes(&self, descriptor: &Descriptor, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let reference = self.digest_reference(descriptor.digest());
        if media_type_str(&Some(descriptor.media_type().clone())) == OCI_MANIFEST_MEDIA_TYPE {
            let accepted = [OCI_MANIFEST_MEDIA_TYPE];
            let (bytes, _digest) = cancellable(
                cancel,
                async { self.client.pull_manifest_raw(&reference, &self.auth, &accepted).await.map_err(|e| anyhow::anyhow!(e)) },
            )
            .await
            .context("pull manifest bytes")?;
            Ok(bytes)
        } else {
            cancellable(
                cancel,
                async { self.client.pull_blob(&reference, &descriptor_to_client(descriptor)).await.map_err(|e| anyhow::anyhow!(e)) },
            )
            .await
            .context("pull blob bytes")
        }
    }

    async fn fetch_stream(
        &self,
        descriptor: &Descriptor,
        sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reference = self.digest_reference(descriptor.digest());
        let mut stream = cancellable(
            cancel,
            async {
                self.client
                    .pull_blob_stream(&reference, &descriptor_to_client(descriptor))
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            },
        )
        .await
        .context("open blob stream")?;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(anyhow::anyhow!("operation cancelled")),
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk.context("read blob chunk")?;
                    sink.write_all(&chunk).await.context("write blob chunk to sink")?;
                }
            }
        }
        sink.flush().await.context("flush blob sink")?;
        Ok(())
    }

    async fn push_blob(&self, media_type: &str, path: &Path, cancel: &CancellationToken) -> Result<Descriptor> {
        let data = tokio::fs::read(path).await.context("read blob file for push")?;
        self.push_bytes(media_type, &data, cancel).await
    }

    async fn push_bytes(&self, media_type: &str, data: &[u8], cancel: &CancellationToken) -> Result<Descriptor> {
        let digest = format!("sha256:{:x}", Sha256::digest(data));
        cancellable(
            cancel,
            async {
                self.client
                    .push_blob(&format!("{}/{}", self.registry, self.repository), data, &digest)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            },
        )
        .await
        .context("push blob")?;
        DescriptorBuilder::default()
            .media_type(MediaType::Other(media_type.to_string()))
            .digest(digest)
            .size(data.len() as i64)
            .build()
            .context("build pushed blob descriptor")
    }

    async fn push_manifest(&self, manifest: &ImageManifest, cancel: &CancellationToken) -> Result<Descriptor> {
        let client_manifest = manifest_to_client(manifest)?;
        let bytes = serde_json::to_vec(&client_manifest).context("serialize manifest for push")?;
        let digest = format!("sha256:{:x}", Sha256::digest(&bytes));
        let reference = self.digest_reference(&digest);
        cancellable(
            cancel,
            async {
                self.client
                    .push_manifest(&reference, &OciManifest::Image(client_manifest))
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            },
        )
        .await
        .context("push manifest")?;
        let mut builder = DescriptorBuilder::default();
        builder
            .media_type(MediaType::Other(OCI_MANIFEST_MEDIA_TYPE.to_string()))
            .digest(digest)
            .size(bytes.len() as i64);
        if let Some(at) = manifest.artifact_type() {
            builder.artifact_type(at.clone());
        }
        builder.build().context("build pushed manifest descriptor")
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str, cancel: &CancellationToken) -> Result<()> {
        let by_digest = self.digest_reference(descriptor.digest());
        let accepted = [OCI_MANIFEST_MEDIA_TYPE];
        let (bytes, _digest) = cancellable(
            cancel,
            async { self.client.pull_manifest_raw(&by_digest, &self.auth, &accepted).await.map_err(|e| anyhow::anyhow!(e)) },
        )
        .await
        .context("re-pull manifest to retag")?;
        let client_manifest: OciImageManifest =
            serde_json::from_slice(&bytes).context("decode manifest to retag")?;
        let tagged = self.named_reference(reference);
        cancellable(
            cancel,
            async {
                self.client
                    .push_manifest(&tagged, &OciManifest::Image(client_manifest))
                    .await
                    .map_err(|e| anyhow::anyhow!(e))
            },
        )
        .await
        .context("push manifest under tag")?;
        Ok(())
    }

    /// No verified delete API exists in this client's surface; registries
    /// are permitted to not support it, so this always reports a no-op
    /// rather than erroring the whole push.
    async fn delete_manifest(&self, _descriptor: &Descriptor, _cancel: &CancellationToken) -> Result<bool> {
        Ok(false)
    }

    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Descriptor>> {
        let reference = self.digest_reference(subject.digest());
        let index = cancellable(
            cancel,
            async { self.client.pull_referrers(&reference, artifact_type).await.map_err(|e| anyhow::anyhow!(e)) },
        )
        .await
        .context("pull referrers")?;
        index
            .manifests
            .iter()
            .map(descriptor_from_client)
            .collect::<Result<Vec<_>>>()
    }
}
