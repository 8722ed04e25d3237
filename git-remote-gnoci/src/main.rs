//! Entry point: CLI argument parsing, logging setup, and the line-oriented
//! remote-helper protocol dispatch loop git drives this process through
//! (`capabilities`, `list [for-push]`, a `push` batch, a `fetch` batch).
//! git invokes this binary as `git-remote-gnoci <remote-name> <url>` for
//! urls of the form `gnoci::<registry>/<repo>:<tag>` or
//! `gnoci://<registry>/<repo>:<tag>`.

mod cmd_fetch;
mod cmd_push;
mod communicator;
mod config;
mod git_repo;
mod registry;
mod util;

use std::io::{self, BufRead as _, Write as _};

use anyhow::{Context, Result};
use clap::App;
use gnoci_core::{Communicator, Modeler};
use log::{info, trace, warn};
use tokio_util::sync::CancellationToken;

use communicator::StdioCommunicator;
use config::{Args, Config};
use git_repo::GitRepository;
use registry::OciGraphTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtocolCommand {
    Capabilities,
    List,
    Push,
    Fetch,
    Ignore,
}

fn parse_protocol_command(line: &str) -> ProtocolCommand {
    let command = line.split_ascii_whitespace().next().unwrap_or_default();
    if command == "capabilities" {
        ProtocolCommand::Capabilities
    } else if command.starts_with("list") {
        ProtocolCommand::List
    } else if command.starts_with("push") {
        ProtocolCommand::Push
    } else if command.starts_with("fetch") {
        ProtocolCommand::Fetch
    } else {
        ProtocolCommand::Ignore
    }
}

/// Consume a `fetch` batch until the terminating blank line. Every layer not
/// already seen locally is pulled regardless of which shas were requested,
/// since packs are self-contained, so the individual `fetch <sha> <name>`
/// lines carry no information this helper needs beyond "more batch follows".
fn collect_fetch_batch<I>(lines: &mut I, first_line: &str) -> Result<()>
where
    I: Iterator<Item = io::Result<String>>,
{
    if first_line.trim().is_empty() {
        return Ok(());
    }
    loop {
        match lines.next() {
            Some(Ok(line)) if line.trim().is_empty() => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("read fetch batch line"),
            None => return Ok(()),
        }
    }
}

fn handle_capabilities() -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "push")?;
    writeln!(out, "fetch")?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// `list`/`list for-push` are identical for this system: report every
/// branch and tag currently recorded in the remote's git config, in git's
/// `<commit> <refname>` wire format, terminated by a blank line. A remote
/// with no manifest yet (nothing has been pushed) reports an empty list
/// rather than failing.
async fn handle_list(config: &Config, target: &OciGraphTarget, cancel: &CancellationToken) -> Result<()> {
    let mut modeler = Modeler::new(config.reference());
    modeler
        .fetch_or_default(target, cancel)
        .await
        .context("fetch remote state for list")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (name, info) in modeler.head_refs().iter().chain(modeler.tag_refs().iter()) {
        writeln!(out, "{} {}", info.commit, name)?;
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

async fn handle_push<I>(
    config: &Config,
    target: &OciGraphTarget,
    repo: &GitRepository,
    lines: &mut I,
    first_line: String,
    cancel: &CancellationToken,
) -> Result<()>
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut communicator = StdioCommunicator::new(lines, first_line);
    let requests = communicator
        .parse_push_request_batch()
        .context("parse push batch")?;
    info!("pushing {} reference(s) to {}", requests.len(), config.reference());

    let responses = cmd_push::push(config, target, repo, &requests, cancel)
        .await
        .context("push")?;
    for response in &responses {
        if let Some(err) = &response.error {
            warn!("push to {} rejected: {err}", response.remote);
        }
    }
    communicator
        .write_push_response(&responses)
        .context("write push response")
}

async fn handle_fetch<I>(
    config: &Config,
    target: &OciGraphTarget,
    lines: &mut I,
    first_line: String,
    cancel: &CancellationToken,
) -> Result<()>
where
    I: Iterator<Item = io::Result<String>>,
{
    collect_fetch_batch(lines, &first_line)?;
    cmd_fetch::fetch(config, target, cancel).await.context("fetch")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

async fn run(config: &Config) -> Result<()> {
    let target = OciGraphTarget::new(&config.registry, &config.repository, config.insecure)
        .context("construct OCI registry client")?;
    let repo = GitRepository::open(&config.git_dir).context("open local git repository")?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(e).context("read remote-helper protocol line"),
            None => return Ok(()),
        };
        trace!("received command: {line:?}");
        match parse_protocol_command(&line) {
            ProtocolCommand::Capabilities => handle_capabilities()?,
            ProtocolCommand::List => handle_list(config, &target, &cancel).await?,
            ProtocolCommand::Push => handle_push(config, &target, &repo, &mut lines, line, &cancel).await?,
            ProtocolCommand::Fetch => handle_fetch(config, &target, &mut lines, line, &cancel).await?,
            ProtocolCommand::Ignore => {}
        }
    }
}

fn build_cli() -> App<'static> {
    App::new("git-remote-gnoci")
        .about("A git remote helper that stores a git repository inside an OCI registry artifact.")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .arg_from_usage("-d, --debug 'Enables trace-level logging.'")
        .arg_from_usage("-c, --configuration 'Prints the resolved registry/repository/tag and exits.'")
        .arg_from_usage("[remote_name] 'Configured remote name, passed by git.'")
        .arg_from_usage("[remote_url] 'gnoci:// URL, passed by git.'")
}

fn main() -> Result<()> {
    let mut app = build_cli();
    let matches = app.clone().get_matches();

    let default_level = if matches.contains_id("debug") { "trace" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let (remote_name, remote_url) = match (
        matches.get_one::<String>("remote_name"),
        matches.get_one::<String>("remote_url"),
    ) {
        (Some(name), Some(url)) => (name, url),
        _ => {
            app.print_help().ok();
            println!();
            std::process::exit(1);
        }
    };

    let config = Config::new(Args::new(remote_name, remote_url)).context("resolve remote configuration")?;

    if matches.contains_id("configuration") {
        println!(
            "registry = {}\nrepository = {}\ntag = {}\ninsecure = {}",
            config.registry, config.repository, config.tag, config.insecure
        );
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(async { run(&config).await })
}
