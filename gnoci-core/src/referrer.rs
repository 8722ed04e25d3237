//! The LFS referrer updater: cascades a new Git manifest tag to the LFS
//! side-car by rewriting its `subject`.

use async_trait::async_trait;
use oci_spec::image::Descriptor;
use tokio_util::sync::CancellationToken;

use crate::lfs::LFSModeler;
use crate::traits::{GraphTarget, ReferrerUpdater};

/// Fetches the LFS manifest that referred to the *old* Git manifest
/// descriptor (captured at construction, before `Modeler::push` overwrites
/// it in memory) and republishes it pointing at the new one.
pub struct LfsReferrerUpdater<'a> {
    old_subject: Descriptor,
    lfs: &'a mut LFSModeler,
}

impl<'a> LfsReferrerUpdater<'a> {
    pub fn new(old_subject: Descriptor, lfs: &'a mut LFSModeler) -> LfsReferrerUpdater<'a> {
        LfsReferrerUpdater { old_subject, lfs }
    }
}

#[async_trait]
impl<'a> ReferrerUpdater for LfsReferrerUpdater<'a> {
    async fn update(
        &mut self,
        target: &dyn GraphTarget,
        new_subject: &Descriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let found = self.lfs.fetch_lfs(target, &self.old_subject, cancel).await?;
        if !found {
            return Ok(());
        }
        self.lfs.push_lfs_manifest(target, new_subject, cancel).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modeler::Modeler;
    use crate::testsupport::FakeGraphTarget;

    async fn fresh_git_manifest(target: &FakeGraphTarget, tag: &str, pack_contents: &[u8]) -> Descriptor {
        let cancel = CancellationToken::new();
        let mut modeler = Modeler::new(tag);
        modeler.fetch_or_default(target, &cancel).await.expect("fetch_or_default");
        let dir = tempfile::tempdir().expect("tempdir");
        let pack_path = dir.path().join("pack-0.pack");
        std::fs::write(&pack_path, pack_contents).expect("write pack");
        modeler.add_pack(target, &pack_path, &[], &cancel).await.expect("add_pack");
        modeler.push(target, &mut [], &cancel).await.expect("push")
    }

    #[tokio::test]
    async fn no_existing_lfs_referrer_is_a_no_op() {
        let target = FakeGraphTarget::new();
        let cancel = CancellationToken::new();
        let old_subject = fresh_git_manifest(&target, "registry.example/repo:main", b"pack a").await;
        let mut lfs = LFSModeler::new(Modeler::new("registry.example/repo:main"));
        let mut updater = LfsReferrerUpdater::new(old_subject.clone(), &mut lfs);
        let new_subject = fresh_git_manifest(&target, "registry.example/other:main", b"pack b").await;
        updater.update(&target, &new_subject, &cancel).await.expect("update");
        assert!(lfs.lfs_layers().is_empty());
    }

    #[tokio::test]
    async fn existing_lfs_referrer_is_republished_against_the_new_subject() {
        let target = FakeGraphTarget::new();
        let cancel = CancellationToken::new();
        let old_subject = fresh_git_manifest(&target, "registry.example/repo:main", b"pack a").await;

        let mut seed = LFSModeler::new(Modeler::new("registry.example/repo:main"));
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("blob.bin");
        std::fs::write(&file, b"lfs contents").expect("write");
        seed.push_lfs_file(&target, &file, &cancel).await.expect("push file");
        seed.push_lfs_manifest(&target, &old_subject, &cancel).await.expect("push manifest");

        let new_subject = fresh_git_manifest(&target, "registry.example/other:main", b"pack b").await;
        let mut lfs = LFSModeler::new(Modeler::new("registry.example/repo:main"));
        let mut updater = LfsReferrerUpdater::new(old_subject.clone(), &mut lfs);
        updater.update(&target, &new_subject, &cancel).await.expect("update");

        let referrers = target
            .referrers(&new_subject, Some(crate::model::ARTIFACT_TYPE_LFS), &cancel)
            .await
            .expect("referrers");
        assert_eq!(referrers.len(), 1);
        let old_referrers = target
            .referrers(&old_subject, Some(crate::model::ARTIFACT_TYPE_LFS), &cancel)
            .await
            .expect("referrers");
        assert!(old_referrers.is_empty());
    }
}
