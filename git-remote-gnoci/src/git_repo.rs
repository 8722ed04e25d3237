//! `gnoci_core::Repository` backed by a real `git2` object database: local
//! ref resolution, ancestry checks, object enumeration, and pack
//! construction for the repository the helper was invoked against.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use gnoci_core::{CommitHash, GitObjectId};

use crate::util::git_command;

pub struct GitRepository {
    repo: git2::Repository,
    git_dir: PathBuf,
}

fn oid_to_hash(oid: git2::Oid) -> CommitHash {
    gix_hash::ObjectId::from_hex(oid.to_string().as_bytes()).expect("git2::Oid is always valid hex")
}

fn hash_to_oid(hash: &CommitHash) -> Result<git2::Oid> {
    git2::Oid::from_str(&hash.to_string()).context("convert commit hash to git2::Oid")
}

impl GitRepository {
    pub fn open(git_dir: &Path) -> Result<GitRepository> {
        let repo = git2::Repository::open(git_dir).context("open local git repository")?;
        Ok(GitRepository {
            repo,
            git_dir: git_dir.to_path_buf(),
        })
    }

    /// Walk `tree_oid`'s full contents. When `collect` is set, every object
    /// not already in `seen` is appended to `out`; either way, everything
    /// walked is inserted into `seen` so a later pass can tell it apart
    /// from genuinely new history.
    fn walk_tree(
        &self,
        tree_oid: git2::Oid,
        seen: &mut HashSet<git2::Oid>,
        out: &mut Vec<GitObjectId>,
        collect: bool,
    ) -> Result<()> {
        if !seen.insert(tree_oid) {
            return Ok(());
        }
        if collect {
            out.push(GitObjectId(oid_to_hash(tree_oid)));
        }
        let tree = self.repo.find_tree(tree_oid).context("find tree")?;
        for entry in tree.iter() {
            let entry_oid = entry.id();
            match entry.kind() {
                Some(git2::ObjectType::Tree) => {
                    self.walk_tree(entry_oid, seen, out, collect)?;
                }
                _ => {
                    if seen.insert(entry_oid) && collect {
                        out.push(GitObjectId(oid_to_hash(entry_oid)));
                    }
                }
            }
        }
        Ok(())
    }
}

impl gnoci_core::Repository for GitRepository {
    fn resolve_local_ref(&self, short_name: &str) -> Result<Option<CommitHash>> {
        let reference = match self.repo.resolve_reference_from_short_name(short_name) {
            Ok(r) => r,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e).context("resolve local reference"),
        };
        let resolved = reference.resolve().context("resolve symbolic reference")?;
        Ok(resolved.target().map(oid_to_hash))
    }

    fn is_ancestor(&self, ancestor: CommitHash, descendant: CommitHash) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        let ancestor_oid = hash_to_oid(&ancestor)?;
        let descendant_oid = hash_to_oid(&descendant)?;
        self.repo
            .graph_descendant_of(descendant_oid, ancestor_oid)
            .context("graph_descendant_of")
    }

    fn enumerate_reachable(&self, tips: &[CommitHash], exclude: &[CommitHash]) -> Result<Vec<GitObjectId>> {
        let mut seen = HashSet::new();

        if !exclude.is_empty() {
            let mut walk = self.repo.revwalk().context("revwalk for exclude")?;
            for commit in exclude {
                walk.push(hash_to_oid(commit)?).context("push exclude commit")?;
            }
            let mut discard = Vec::new();
            for oid in walk {
                let oid = oid.context("walk exclude ancestry")?;
                if !seen.insert(oid) {
                    continue;
                }
                let commit = self.repo.find_commit(oid).context("find excluded commit")?;
                self.walk_tree(commit.tree_id(), &mut seen, &mut discard, false)?;
            }
        }

        let mut out = Vec::new();
        if tips.is_empty() {
            return Ok(out);
        }

        let mut walk = self.repo.revwalk().context("revwalk for tips")?;
        walk.set_sorting(git2::Sort::TOPOLOGICAL).context("set sorting")?;
        for tip in tips {
            walk.push(hash_to_oid(tip)?).context("push tip commit")?;
        }
        for commit in exclude {
            walk.hide(hash_to_oid(commit)?).context("hide excluded commit")?;
        }

        for oid in walk {
            let oid = oid.context("walk new history")?;
            if !seen.insert(oid) {
                continue;
            }
            out.push(GitObjectId(oid_to_hash(oid)));
            let commit = self.repo.find_commit(oid).context("find new commit")?;
            self.walk_tree(commit.tree_id(), &mut seen, &mut out, true)?;
        }

        Ok(out)
    }

    fn write_pack(&self, objects: &[GitObjectId], dest_dir: &Path) -> Result<PathBuf> {
        let mut child = git_command()
            .current_dir(&self.git_dir)
            .arg("pack-objects")
            .arg("--window=10")
            .arg(dest_dir.join("pack"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn git pack-objects")?;

        {
            let stdin = child.stdin.as_mut().context("pack-objects stdin")?;
            for object in objects {
                writeln!(stdin, "{}", object.0).context("write object id to pack-objects")?;
            }
        }

        let output = child.wait_with_output().context("wait for git pack-objects")?;
        if !output.status.success() {
            anyhow::bail!(
                "git pack-objects failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        let hash = String::from_utf8(output.stdout)
            .context("pack-objects stdout is not utf8")?
            .trim()
            .to_string();
        if hash.is_empty() {
            anyhow::bail!("git pack-objects did not print a pack hash");
        }
        Ok(dest_dir.join(format!("pack-{hash}.pack")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnoci_core::Repository as _;

    fn init_repo_with_commit(dir: &Path) -> (git2::Repository, git2::Oid) {
        let repo = git2::Repository::init(dir).expect("git init");
        let sig = git2::Signature::now("test", "test@example.com").expect("signature");
        let tree_oid = {
            let mut builder = repo.treebuilder(None).expect("treebuilder");
            builder.write().expect("write empty tree")
        };
        let tree = repo.find_tree(tree_oid).expect("find tree");
        let commit_oid = repo
            .commit(Some("refs/heads/main"), &sig, &sig, "initial", &tree, &[])
            .expect("commit");
        (repo, commit_oid)
    }

    #[test]
    fn oid_to_hash_and_back_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_repo, oid) = init_repo_with_commit(dir.path());
        let hash = oid_to_hash(oid);
        assert_eq!(hash_to_oid(&hash).unwrap(), oid);
    }

    #[test]
    fn resolve_local_ref_finds_existing_branch_and_reports_none_for_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_repo, oid) = init_repo_with_commit(dir.path());
        let gitrepo = GitRepository::open(dir.path()).expect("open");

        let resolved = gitrepo.resolve_local_ref("main").expect("resolve");
        assert_eq!(resolved, Some(oid_to_hash(oid)));

        assert_eq!(gitrepo.resolve_local_ref("does-not-exist").expect("resolve"), None);
    }

    #[test]
    fn is_ancestor_is_reflexive_for_the_same_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_repo, oid) = init_repo_with_commit(dir.path());
        let gitrepo = GitRepository::open(dir.path()).expect("open");
        let hash = oid_to_hash(oid);
        assert!(gitrepo.is_ancestor(hash, hash).expect("is_ancestor"));
    }

    #[test]
    fn enumerate_reachable_with_no_tips_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_repo_with_commit(dir.path());
        let gitrepo = GitRepository::open(dir.path()).expect("open");
        assert!(gitrepo.enumerate_reachable(&[], &[]).expect("enumerate").is_empty());
    }

    #[test]
    fn enumerate_reachable_includes_the_tip_commit_and_its_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_repo, oid) = init_repo_with_commit(dir.path());
        let gitrepo = GitRepository::open(dir.path()).expect("open");
        let hash = oid_to_hash(oid);
        let objects = gitrepo.enumerate_reachable(&[hash], &[]).expect("enumerate");
        assert!(objects.iter().any(|o| o.0 == hash));
    }
}
