//! Contracts the core consumes from its external collaborators: the OCI
//! registry (`GraphTarget`), the local git object store (`Repository`),
//! and the remote-helper protocol dialog (`Communicator`). Concrete
//! implementations live in the `git-remote-gnoci` binary crate; this crate
//! only depends on the traits.

use async_trait::async_trait;
use oci_spec::image::{Descriptor, ImageManifest};
use tokio_util::sync::CancellationToken;

use crate::model::{CommitHash, ReferenceName};

/// A handle to an OCI registry repository, consumed by `Modeler`/`LFSModeler`.
/// Every method takes a cancellation token so a caller tearing down a push or
/// fetch partway through can stop in-flight registry round-trips promptly
/// rather than waiting for them to finish on their own.
#[async_trait]
pub trait GraphTarget: Send + Sync {
    /// Resolve `reference` (a tag or digest) to its manifest descriptor.
    /// `Ok(None)` means the reference does not exist; any other failure
    /// (auth, transport) is a genuine error.
    async fn resolve(&self, reference: &str, cancel: &CancellationToken) -> anyhow::Result<Option<Descriptor>>;

    /// Fetch and return the full contents addressed by `descriptor`. Used
    /// for manifests and the (small, JSON) config blob.
    async fn fetch_bytes(&self, descriptor: &Descriptor, cancel: &CancellationToken) -> anyhow::Result<Vec<u8>>;

    /// Stream the blob addressed by `descriptor` into `sink`, reporting
    /// byte counts as they are written so callers can wrap `sink` in a
    /// `progress::CountingWriter` beforehand.
    async fn fetch_stream(
        &self,
        descriptor: &Descriptor,
        sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Upload the contents of `path` as a blob of the given media type and
    /// return its descriptor. Reading from a file (rather than an
    /// in-memory buffer) keeps large layers off the heap and lets callers
    /// wrap the read in a progress counter.
    async fn push_blob(
        &self,
        media_type: &str,
        path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Descriptor>;

    /// Upload `data` as a blob of the given media type and return its
    /// descriptor. For small in-memory blobs (the git config, the empty
    /// OCI config sentinel) where staging a temp file would be wasted
    /// ceremony.
    async fn push_bytes(
        &self,
        media_type: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> anyhow::Result<Descriptor>;

    /// Push a manifest and return its descriptor. Does not tag it.
    async fn push_manifest(
        &self,
        manifest: &ImageManifest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Descriptor>;

    /// Tag `descriptor` as `reference`.
    async fn tag(&self, descriptor: &Descriptor, reference: &str, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Best-effort delete of a manifest. Registries need not support
    /// deletion; implementations that cannot delete return `Ok(false)`
    /// rather than an error so callers can treat it as a no-op.
    async fn delete_manifest(&self, descriptor: &Descriptor, cancel: &CancellationToken) -> anyhow::Result<bool>;

    /// List referrers of `subject`, optionally filtered to one artifact
    /// type. An empty filter returns referrers of every artifact type;
    /// callers that already know which artifact type they want (the LFS
    /// side-car manifest, say) should pass it to avoid tripping over an
    /// unrelated referrer cohabiting the same subject.
    async fn referrers(
        &self,
        subject: &Descriptor,
        artifact_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Descriptor>>;
}

/// Invoked by `Modeler::push` once the new Git manifest has been tagged, to
/// cascade the update to a dependent manifest. Implementations hold
/// whatever "old" state they need (e.g. the previous subject descriptor)
/// from before `push` began.
#[async_trait]
pub trait ReferrerUpdater: Send + Sync {
    async fn update(
        &mut self,
        target: &dyn GraphTarget,
        new_subject: &Descriptor,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// A single git object, identified by its hash, in the form the local
/// object store can hand back for insertion into a packfile.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GitObjectId(pub CommitHash);

/// The local git object store the reconciliation engine walks to decide
/// what must be packed.
pub trait Repository {
    /// Resolve a short name (as git would for `git rev-parse`) to the
    /// commit it currently points at. `Ok(None)` means the name does not
    /// resolve (distinct from resolving to the sentinel null commit).
    fn resolve_local_ref(&self, short_name: &str) -> anyhow::Result<Option<CommitHash>>;

    /// True if `ancestor` is `descendant` or a proper ancestor of it.
    fn is_ancestor(&self, ancestor: CommitHash, descendant: CommitHash) -> anyhow::Result<bool>;

    /// Enumerate every object reachable from any of `tips` that is not
    /// reachable from any of `exclude`.
    fn enumerate_reachable(
        &self,
        tips: &[CommitHash],
        exclude: &[CommitHash],
    ) -> anyhow::Result<Vec<GitObjectId>>;

    /// Write `objects` into a single packfile (delta window 10, ref-deltas
    /// enabled) inside `dest_dir` and return its path.
    fn write_pack(
        &self,
        objects: &[GitObjectId],
        dest_dir: &std::path::Path,
    ) -> anyhow::Result<std::path::PathBuf>;
}

/// One entry of a push batch from the remote-helper protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushRequest {
    /// The local ref/commit being pushed, or `None` for a delete.
    pub src: Option<String>,
    pub remote: ReferenceName,
    pub force: bool,
}

/// The per-reference outcome reported back to git.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushResponse {
    pub remote: ReferenceName,
    pub error: Option<String>,
}

/// The line-oriented protocol dialog with the invoking `git` process.
pub trait Communicator {
    fn parse_push_request_batch(&mut self) -> anyhow::Result<Vec<PushRequest>>;
    fn write_push_response(&mut self, responses: &[PushResponse]) -> anyhow::Result<()>;
}
