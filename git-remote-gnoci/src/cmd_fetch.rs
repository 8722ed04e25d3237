//! `fetch` command: bring every layer not yet seen locally into the git
//! object database. Packs are self-contained, so rather than mapping
//! requested shas to specific layers, every layer not already recorded as
//! fetched is pulled and indexed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use gnoci_core::{LayerDigest, Modeler};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::registry::OciGraphTarget;
use crate::util::git_command;

fn fetched_layers_path(config: &Config) -> PathBuf {
    config.git_dir.join("gnoci").join(format!("{}.fetched-layers", config.remote_name))
}

fn load_fetched_layers(path: &Path) -> Result<HashSet<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e).context("read fetched-layers marker file"),
    }
}

fn save_fetched_layers(path: &Path, layers: &HashSet<String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("create gnoci state directory")?;
    }
    let mut sorted: Vec<&str> = layers.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    std::fs::write(path, sorted.join("\n")).context("write fetched-layers marker file")
}

async fn index_pack(config: &Config, path: &Path) -> Result<()> {
    let mut child = git_command()
        .env("GIT_DIR", &config.git_dir)
        .arg("index-pack")
        .arg("--stdin")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("spawn git index-pack")?;

    let bytes = tokio::fs::read(path).await.context("read scratch pack file")?;
    {
        let stdin = child.stdin.as_mut().context("index-pack stdin")?;
        stdin.write_all(&bytes).await.context("write pack bytes to index-pack")?;
    }
    let output = child.wait_with_output().await.context("wait for git index-pack")?;
    if !output.status.success() {
        anyhow::bail!("git index-pack failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

pub async fn fetch(config: &Config, target: &OciGraphTarget, cancel: &CancellationToken) -> Result<()> {
    let mut modeler = Modeler::new(config.reference());
    modeler.fetch(target, cancel).await?;

    let marker_path = fetched_layers_path(config);
    let mut fetched = load_fetched_layers(&marker_path)?;

    let scratch = tempfile::tempdir().context("scratch dir for fetched packs")?;
    for layer in modeler.layers() {
        let digest = layer.digest().to_string();
        if fetched.contains(&digest) {
            continue;
        }

        let layer_path = scratch.path().join(digest.replace(':', "-"));
        let mut file = tokio::fs::File::create(&layer_path).await.context("create scratch pack file")?;
        let parsed_digest = LayerDigest::parse(digest.clone())?;
        modeler.fetch_layer(target, &parsed_digest, &mut file, cancel).await?;
        file.flush().await.context("flush scratch pack file")?;
        drop(file);

        index_pack(config, &layer_path).await?;
        fetched.insert(digest);
    }

    save_fetched_layers(&marker_path, &fetched)?;
    Ok(())
}
