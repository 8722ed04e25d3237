//! The OCI-as-git data model and push reconciliation engine (see the
//! module-level docs of each submodule for the corresponding design
//! section). This crate owns THE CORE: everything that decides what must
//! be transferred and how the OCI artifact is shaped. It knows nothing
//! about git's wire protocol, the registry transport, or the local
//! object database beyond the `Communicator`/`GraphTarget`/`Repository`
//! contracts in [`traits`] — concrete implementations of those live in
//! the `git-remote-gnoci` binary crate.

pub mod comparer;
pub mod error;
pub mod lfs;
pub mod model;
pub mod modeler;
pub mod progress;
pub mod reconcile;
pub mod referrer;
pub mod traits;

#[cfg(test)]
pub(crate) mod testsupport;

pub use comparer::{Comparer, RefPair, Status};
pub use error::{Error, Result};
pub use lfs::LFSModeler;
pub use model::{
    ARTIFACT_TYPE_GIT, ARTIFACT_TYPE_LFS, CommitHash, GitConfig, LayerDigest,
    MEDIA_TYPE_CONFIG_GIT, MEDIA_TYPE_LAYER_LFS, MEDIA_TYPE_LAYER_PACK, ReferenceClass,
    ReferenceInfo, ReferenceName, null_commit,
};
pub use modeler::Modeler;
pub use reconcile::reconcile_push;
pub use referrer::LfsReferrerUpdater;
pub use traits::{Communicator, GitObjectId, GraphTarget, PushRequest, PushResponse, ReferrerUpdater, Repository};
