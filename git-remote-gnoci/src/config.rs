//! Remote URL and git config parsing: turns the `<remote-name> <url>` pair
//! git invokes the helper with into a registry, repository, and tag, plus
//! the handful of `remote.<name>.gnoci-*` overrides this system reads.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Arguments git passes on the command line: `$1` is the configured remote
/// name, `$2` is the URL. The `gnoci::`/`gnoci://` scheme prefix may or may
/// not still be present depending on how git's transport-helper dispatch
/// stripped it.
pub struct Args {
    pub remote_name: String,
    pub remote_spec: String,
}

impl Args {
    pub fn new(remote_name: &str, remote_spec: &str) -> Args {
        Args {
            remote_name: remote_name.to_string(),
            remote_spec: remote_spec.to_string(),
        }
    }
}

fn strip_scheme(spec: &str) -> &str {
    spec.strip_prefix("gnoci://")
        .or_else(|| spec.strip_prefix("gnoci::"))
        .unwrap_or(spec)
}

/// Split `<registry>/<repository>[:<tag>]` the way a docker-style
/// reference is parsed: the tag is whatever follows the last `:` as long
/// as that segment contains no `/` (so a registry port, e.g.
/// `localhost:5000/repo`, is not mistaken for a tag separator).
fn parse_spec(spec: &str) -> Result<(String, String, String)> {
    let (before_tag, tag) = match spec.rsplit_once(':') {
        Some((head, tag)) if !tag.is_empty() && !tag.contains('/') => (head, tag.to_string()),
        _ => (spec, "latest".to_string()),
    };
    let (registry, repository) = before_tag
        .split_once('/')
        .with_context(|| format!("remote spec {spec:?} must be <registry>/<repository>[:tag]"))?;
    if registry.is_empty() || repository.is_empty() {
        anyhow::bail!("remote spec {spec:?} must be <registry>/<repository>[:tag]");
    }
    Ok((registry.to_string(), repository.to_string(), tag))
}

fn read_config_bool(git_dir: &std::path::Path, remote_name: &str, key: &str) -> Result<bool> {
    let repo = git2::Repository::open(git_dir).context("open local repository for config")?;
    let config = repo.config().context("open git config")?;
    Ok(config
        .get_bool(&format!("remote.{remote_name}.{key}"))
        .unwrap_or(false))
}

/// Everything the binary needs to drive one invocation: which local
/// repository to read/write objects from, and which registry
/// repository/tag to model as its single ref namespace.
pub struct Config {
    pub remote_name: String,
    pub git_dir: PathBuf,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    /// `remote.<name>.gnoci-insecure`: talk plain HTTP instead of HTTPS,
    /// for registries run on a private network without TLS.
    pub insecure: bool,
}

impl Config {
    pub fn new(args: Args) -> Result<Config> {
        let git_dir = std::env::var("GIT_DIR").context("GIT_DIR not set by git")?;
        let git_dir = PathBuf::from(git_dir);

        let spec = strip_scheme(&args.remote_spec);
        let (registry, repository, tag) =
            parse_spec(spec).with_context(|| format!("parsing remote spec {spec:?}"))?;
        let insecure = read_config_bool(&git_dir, &args.remote_name, "gnoci-insecure").unwrap_or(false);

        Ok(Config {
            remote_name: args.remote_name,
            git_dir,
            registry,
            repository,
            tag,
            insecure,
        })
    }

    /// Reference string `Modeler`/`LFSModeler` track state under. The tag
    /// alone is enough: registry/repository are fixed per `OciGraphTarget`.
    pub fn reference(&self) -> &str {
        &self.tag
    }
}
