//! `push` command: drive the core's reconciliation engine against one
//! registry/repository over a single invocation, cascading the result to
//! the LFS side-car manifest.

use anyhow::Result;
use gnoci_core::{LFSModeler, LfsReferrerUpdater, Modeler, PushRequest, PushResponse, ReferrerUpdater, reconcile_push};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::git_repo::GitRepository;
use crate::registry::OciGraphTarget;

pub async fn push(
    config: &Config,
    target: &OciGraphTarget,
    repo: &GitRepository,
    requests: &[PushRequest],
    cancel: &CancellationToken,
) -> Result<Vec<PushResponse>> {
    let mut modeler = Modeler::new(config.reference());
    let subject_before_push = modeler.fetch_or_default(target, cancel).await?;

    let mut lfs_helper = LFSModeler::new(Modeler::new(config.reference()));
    let mut updater_storage = subject_before_push.map(|subject| LfsReferrerUpdater::new(subject, &mut lfs_helper));
    let mut updaters: Vec<&mut dyn ReferrerUpdater> = Vec::new();
    if let Some(updater) = updater_storage.as_mut() {
        updaters.push(updater);
    }

    let responses = reconcile_push(target, repo, &mut modeler, requests, &mut updaters, cancel).await?;
    Ok(responses)
}
