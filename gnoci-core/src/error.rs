use thiserror::Error;

/// Error kinds produced by the OCI data model and push reconciliation
/// engine. Per-reference failures are carried as `PushResponse` entries
/// rather than this type; a `reconcile_push` batch only ever returns one
/// of these for whole-operation failures.
#[derive(Error, Debug)]
pub enum Error {
    #[error("manifest not found for {reference}")]
    ManifestNotFound { reference: String },

    #[error("git manifest has no LFS referrer")]
    LfsManifestNotFound,

    #[error("layer {digest} is not present in the current manifest")]
    LayerNotInManifest { digest: String },

    #[error("reference {name} not found")]
    ReferenceNotFound { name: String },

    #[error("reference {name} is not a branch or tag")]
    UnsupportedReferenceType { name: String },

    #[error("push to {name} rejected: not a fast-forward")]
    NonFastForward { name: String },

    #[error("digest {digest} collides with different content (expected size {expected}, got {actual})")]
    Corruption {
        digest: String,
        expected: u64,
        actual: u64,
    },

    #[error("more than one LFS referrer for manifest: expected 1, got {count}")]
    MultipleLfsReferrers { count: usize },

    #[error("registry operation failed")]
    Registry(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
