//! `gnoci_core::Communicator` over stdin/stdout: the line-oriented `push`
//! batch dialog git's transport-helper protocol uses.

use std::io::{self, Write};

use anyhow::{Context, Result};
use gnoci_core::{Communicator, PushRequest, PushResponse, ReferenceName};

/// Reads `push` batch lines from an arbitrary line iterator and writes
/// responses to stdout. `first_line` is the `push ...` line the outer
/// dispatch loop already consumed while deciding which command this was.
pub struct StdioCommunicator<'a> {
    lines: &'a mut dyn Iterator<Item = io::Result<String>>,
    first_line: Option<String>,
}

impl<'a> StdioCommunicator<'a> {
    pub fn new(lines: &'a mut dyn Iterator<Item = io::Result<String>>, first_line: String) -> StdioCommunicator<'a> {
        StdioCommunicator {
            lines,
            first_line: Some(first_line),
        }
    }
}

fn parse_push_line(line: &str) -> Result<PushRequest> {
    let spec = line
        .strip_prefix("push ")
        .with_context(|| format!("expected a push line, got {line:?}"))?;
    let (force, spec) = match spec.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    let (src, dst) = spec
        .split_once(':')
        .with_context(|| format!("push spec {spec:?} missing ':'"))?;
    let src = if src.is_empty() { None } else { Some(src.to_string()) };
    Ok(PushRequest {
        src,
        remote: ReferenceName::new(dst),
        force,
    })
}

impl<'a> Communicator for StdioCommunicator<'a> {
    fn parse_push_request_batch(&mut self) -> Result<Vec<PushRequest>> {
        let mut requests = Vec::new();
        if let Some(line) = self.first_line.take() {
            requests.push(parse_push_line(&line)?);
        }
        while let Some(line) = self.lines.next() {
            let line = line.context("read push batch line")?;
            if line.is_empty() {
                break;
            }
            requests.push(parse_push_line(&line)?);
        }
        Ok(requests)
    }

    fn write_push_response(&mut self, responses: &[PushResponse]) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for response in responses {
            match &response.error {
                None => writeln!(out, "ok {}", response.remote)?,
                Some(msg) => writeln!(out, "error {} {}", response.remote, msg)?,
            }
        }
        writeln!(out)?;
        out.flush()?;
        Ok(())
    }
}
