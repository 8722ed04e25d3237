//! Per-reference push comparison: given `(force, localName, remoteName)`,
//! decide whether the push needs a delete, a cheap pointer bump onto an
//! already-known layer, or a new pack; cache the decision per remote name.

use std::cell::RefCell;
use std::collections::HashMap;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::model::{CommitHash, LayerDigest, ReferenceName};
use crate::modeler::Modeler;
use crate::traits::Repository;

bitflags! {
    /// What a push to one reference requires. Several bits can be set at
    /// once: a forced non-fast-forward update is `UPDATE_REF | ADD_COMMIT
    /// | FORCE`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        /// The remote ref should be removed from the config entirely.
        const DELETE      = 0b0001;
        /// The remote ref's `ReferenceInfo.commit` should be rewritten.
        const UPDATE_REF  = 0b0010;
        /// New commits need to be enumerated and packed.
        const ADD_COMMIT  = 0b0100;
        /// The update is a non-fast-forward, permitted only because the
        /// caller asked to force it.
        const FORCE       = 0b1000;
        /// The update is a non-fast-forward and was not forced; the
        /// caller must report it to git as a rejected ref rather than
        /// perform it.
        const REJECTED    = 0b0001_0000;
    }
}

/// The cached outcome of comparing one reference. When `layer` is set,
/// the local commit was already found in an existing
/// remote pack layer, and the caller should take the cheap pointer-bump
/// path instead of building a new pack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefPair {
    pub local: Option<CommitHash>,
    pub remote: Option<CommitHash>,
    pub status: Status,
    pub layer: Option<LayerDigest>,
}

/// Compares references against the local commit graph and the model's
/// existing layers, caching one decision per remote name (property 5).
pub struct Comparer<'a> {
    repo: &'a dyn Repository,
    cache: RefCell<HashMap<ReferenceName, RefPair>>,
}

impl<'a> Comparer<'a> {
    pub fn new(repo: &'a dyn Repository) -> Comparer<'a> {
        Comparer {
            repo,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve and classify `remote_name`. `local_name` is the local
    /// short name to push from, or `None` for a deletion request.
    pub fn compare(&self, modeler: &Modeler, force: bool, local_name: Option<&str>, remote_name: &ReferenceName) -> Result<RefPair> {
        if let Some(cached) = self.cache.borrow().get(remote_name) {
            return Ok(cached.clone());
        }

        let remote = match modeler.resolve_ref(remote_name) {
            Ok(info) => Some(info.commit),
            Err(Error::ReferenceNotFound { .. }) => None,
            Err(other) => return Err(other),
        };

        let local = match local_name {
            None => None,
            Some(n) => self.repo.resolve_local_ref(n).map_err(Error::Registry)?,
        };

        let pair = self.classify(modeler, local, remote, force)?;
        self.cache.borrow_mut().insert(remote_name.clone(), pair.clone());
        Ok(pair)
    }

    fn classify(&self, modeler: &Modeler, local: Option<CommitHash>, remote: Option<CommitHash>, force: bool) -> Result<RefPair> {
        let Some(local_commit) = local.clone() else {
            return Ok(RefPair {
                local: None,
                remote,
                status: Status::DELETE | Status::UPDATE_REF,
                layer: None,
            });
        };

        if let Some(layer) = modeler.commit_exists(self.repo, &local_commit).map_err(Error::Registry)? {
            return Ok(RefPair {
                local,
                remote,
                status: Status::UPDATE_REF,
                layer: Some(layer),
            });
        }

        let is_new_or_fast_forward = match &remote {
            None => true,
            Some(remote_commit) => self
                .repo
                .is_ancestor(remote_commit.clone(), local_commit.clone())
                .map_err(Error::Registry)?,
        };

        if is_new_or_fast_forward {
            return Ok(RefPair {
                local,
                remote,
                status: Status::ADD_COMMIT | Status::UPDATE_REF,
                layer: None,
            });
        }

        if force {
            return Ok(RefPair {
                local,
                remote,
                status: Status::FORCE | Status::ADD_COMMIT | Status::UPDATE_REF,
                layer: None,
            });
        }

        Ok(RefPair {
            local,
            remote,
            status: Status::REJECTED,
            layer: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReferenceInfo;
    use crate::testsupport::FakeGraphTarget;
    use std::cell::RefCell as StdRefCell;
    use tokio_util::sync::CancellationToken;

    struct FakeRepo {
        local_refs: HashMap<String, CommitHash>,
        ancestry: HashMap<(CommitHash, CommitHash), bool>,
        ancestry_calls: StdRefCell<u32>,
    }

    impl Repository for FakeRepo {
        fn resolve_local_ref(&self, short_name: &str) -> anyhow::Result<Option<CommitHash>> {
            Ok(self.local_refs.get(short_name).cloned())
        }

        fn is_ancestor(&self, ancestor: CommitHash, descendant: CommitHash) -> anyhow::Result<bool> {
            *self.ancestry_calls.borrow_mut() += 1;
            if ancestor == descendant {
                return Ok(true);
            }
            Ok(*self.ancestry.get(&(ancestor, descendant)).unwrap_or(&false))
        }

        fn enumerate_reachable(&self, _tips: &[CommitHash], _exclude: &[CommitHash]) -> anyhow::Result<Vec<crate::traits::GitObjectId>> {
            unimplemented!("not exercised by comparer tests")
        }

        fn write_pack(&self, _objects: &[crate::traits::GitObjectId], _dest_dir: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
            unimplemented!("not exercised by comparer tests")
        }
    }

    fn hash(byte: u8) -> CommitHash {
        let hex = format!("{byte:02x}").repeat(20);
        gix_hash::ObjectId::from_hex(hex.as_bytes()).expect("valid test hash")
    }

    async fn empty_modeler() -> Modeler {
        let target = FakeGraphTarget::new();
        let mut modeler = Modeler::new("registry.example/repo:main");
        modeler
            .fetch_or_default(&target, &CancellationToken::new())
            .await
            .expect("fetch_or_default");
        modeler
    }

    #[tokio::test]
    async fn new_branch_with_no_remote_entry_requires_update_and_add() {
        let modeler = empty_modeler().await;
        let repo = FakeRepo {
            local_refs: HashMap::from([("refs/heads/main".to_string(), hash(1))]),
            ancestry: HashMap::new(),
            ancestry_calls: StdRefCell::new(0),
        };
        let cmp = Comparer::new(&repo);
        let pair = cmp
            .compare(&modeler, false, Some("refs/heads/main"), &ReferenceName::new("refs/heads/main"))
            .expect("compare");
        assert_eq!(pair.status, Status::UPDATE_REF | Status::ADD_COMMIT);
        assert!(pair.layer.is_none());
    }

    #[tokio::test]
    async fn delete_request_yields_delete_bit_only() {
        let modeler = empty_modeler().await;
        let repo = FakeRepo {
            local_refs: HashMap::new(),
            ancestry: HashMap::new(),
            ancestry_calls: StdRefCell::new(0),
        };
        let cmp = Comparer::new(&repo);
        let pair = cmp
            .compare(&modeler, false, None, &ReferenceName::new("refs/tags/v1"))
            .expect("compare");
        assert_eq!(pair.status, Status::DELETE | Status::UPDATE_REF);
    }

    #[tokio::test]
    async fn non_fast_forward_without_force_is_rejected_and_with_force_sets_force_bit() {
        let repo = FakeRepo {
            local_refs: HashMap::from([("refs/heads/main".to_string(), hash(2))]),
            ancestry: HashMap::new(),
            ancestry_calls: StdRefCell::new(0),
        };
        let mut modeler = empty_modeler().await;
        // Give refs/heads/main a remote commit distinct from local, with no
        // ancestry relationship recorded (defaults to false).
        seed_remote_ref(&mut modeler, "refs/heads/main", hash(1)).await;

        let cmp = Comparer::new(&repo);
        let rejected = cmp
            .compare(&modeler, false, Some("refs/heads/main"), &ReferenceName::new("refs/heads/main"))
            .expect("compare");
        assert_eq!(rejected.status, Status::REJECTED);

        let cmp2 = Comparer::new(&repo);
        let forced = cmp2
            .compare(&modeler, true, Some("refs/heads/main"), &ReferenceName::new("refs/heads/main"))
            .expect("compare");
        assert_eq!(forced.status, Status::FORCE | Status::ADD_COMMIT | Status::UPDATE_REF);
    }

    #[tokio::test]
    async fn decision_is_cached_per_remote_name() {
        let modeler = empty_modeler().await;
        let repo = FakeRepo {
            local_refs: HashMap::from([("refs/heads/main".to_string(), hash(1))]),
            ancestry: HashMap::new(),
            ancestry_calls: StdRefCell::new(0),
        };
        let cmp = Comparer::new(&repo);
        let name = ReferenceName::new("refs/heads/main");
        cmp.compare(&modeler, false, Some("refs/heads/main"), &name).expect("compare 1");
        cmp.compare(&modeler, false, Some("refs/heads/main"), &name).expect("compare 2");
        assert_eq!(*repo.ancestry_calls.borrow(), 0); // no remote entry: ancestor test never runs
    }

    async fn seed_remote_ref(modeler: &mut Modeler, name: &str, commit: CommitHash) {
        let target = FakeGraphTarget::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.pack");
        std::fs::write(&path, b"seed").unwrap();
        modeler
            .add_pack(&target, &path, &[(ReferenceName::new(name), commit)], &CancellationToken::new())
            .await
            .expect("seed add_pack");
    }
}
