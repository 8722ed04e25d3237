//! Push reconciliation: drive the [`crate::comparer::Comparer`] over a
//! batch of push requests, enumerate the git objects a new pack must
//! contain, materialize that pack via the [`Repository`] contract, stage it
//! on the [`Modeler`], and publish. This is the one piece of the core that
//! ties every other module together for a single `git push`.

use std::collections::HashSet;

use log::warn;
use tokio_util::sync::CancellationToken;

use crate::comparer::{Comparer, Status};
use crate::error::{Error, Result};
use crate::model::{CommitHash, ReferenceName};
use crate::modeler::Modeler;
use crate::traits::{GitObjectId, GraphTarget, PushRequest, PushResponse, ReferrerUpdater, Repository};

/// Walk `requests` against `modeler`/`repo`, materialize and stage a single
/// new pack covering every commit not already reachable from the remote's
/// existing layers, and publish the result. The scratch directory used to
/// build the pack is removed before returning.
///
/// Per-reference failures (unsupported ref class, non-fast-forward without
/// force, resolution errors) are captured in the returned responses and do
/// not abort the batch; packfile construction and registry/model failures
/// abort and propagate.
pub async fn reconcile_push(
    target: &dyn GraphTarget,
    repo: &dyn Repository,
    modeler: &mut Modeler,
    requests: &[PushRequest],
    updaters: &mut [&mut dyn ReferrerUpdater],
    cancel: &CancellationToken,
) -> Result<Vec<PushResponse>> {
    let comparer = Comparer::new(repo);
    let mut responses = Vec::with_capacity(requests.len());
    let mut new_commit_tips: Vec<CommitHash> = Vec::new();
    let mut seen_tips: HashSet<CommitHash> = HashSet::new();
    let mut refs_in_new_pack: Vec<(ReferenceName, CommitHash)> = Vec::new();

    for request in requests {
        let remote_name = request.remote.clone();
        let pair = match comparer.compare(modeler, request.force, request.src.as_deref(), &remote_name) {
            Ok(pair) => pair,
            Err(e) => {
                responses.push(PushResponse {
                    remote: remote_name,
                    error: Some(e.to_string()),
                });
                continue;
            }
        };

        if pair.status.contains(Status::REJECTED) {
            responses.push(PushResponse {
                remote: remote_name.clone(),
                error: Some(Error::NonFastForward { name: remote_name.to_string() }.to_string()),
            });
            continue;
        }

        if pair.status.contains(Status::DELETE) {
            match modeler.delete_ref(&remote_name) {
                Ok(()) => responses.push(PushResponse { remote: remote_name, error: None }),
                Err(e) => responses.push(PushResponse { remote: remote_name, error: Some(e.to_string()) }),
            }
            continue;
        }

        let local_commit = match &pair.local {
            Some(c) => c.clone(),
            None => {
                // UPDATE_REF without a local commit and without DELETE cannot
                // happen per the comparer's state table, but fail the ref
                // rather than panic if it ever does.
                responses.push(PushResponse {
                    remote: remote_name.clone(),
                    error: Some(format!("internal error: no local commit for update of {remote_name}")),
                });
                continue;
            }
        };

        if pair.status.contains(Status::ADD_COMMIT) && seen_tips.insert(local_commit.clone()) {
            new_commit_tips.push(local_commit.clone());
        }

        match pair.layer {
            Some(layer) => match modeler.update_ref(&remote_name, local_commit, &layer) {
                Ok(()) => responses.push(PushResponse { remote: remote_name, error: None }),
                Err(e) => responses.push(PushResponse { remote: remote_name, error: Some(e.to_string()) }),
            },
            None => {
                refs_in_new_pack.push((remote_name.clone(), local_commit));
                responses.push(PushResponse { remote: remote_name, error: None });
            }
        }
    }

    if !new_commit_tips.is_empty() {
        let exclude: Vec<CommitHash> = modeler
            .head_refs()
            .values()
            .chain(modeler.tag_refs().values())
            .map(|info| info.commit.clone())
            .collect();

        let reachable: Vec<GitObjectId> = repo
            .enumerate_reachable(&new_commit_tips, &exclude)
            .map_err(Error::Registry)?;

        let scratch = tempfile::tempdir().map_err(|e| Error::Registry(anyhow::anyhow!(e).context("scratch dir for pack")))?;
        let pack_path = repo
            .write_pack(&reachable, scratch.path())
            .map_err(Error::Registry)?;

        match modeler.add_pack(target, &pack_path, &refs_in_new_pack, cancel).await {
            Ok(()) => {}
            Err(Error::UnsupportedReferenceType { name }) => {
                warn!("dropping unsupported reference {name} from new pack; pack itself was staged");
            }
            Err(e) => return Err(e),
        }
    }

    modeler.push(target, updaters, cancel).await?;
    Ok(responses)
}
