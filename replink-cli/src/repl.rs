//! Code execution commands: exec, run and the interactive passthrough.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use replink::{Channel, Error, ExecError, RunOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::debug;

use crate::session::{Session, finish};

/// Runs `code` and prints what it printed.
pub async fn exec(session: &Session, code: &str) -> Result<()> {
    let mut repl = session.raw().await?;
    let res = repl.exec(code).await;
    match finish(repl, res).await {
        Ok(out) => {
            print!("{out}");
            Ok(())
        }
        Err(e) => Err(explain(e)),
    }
}

/// Uploads a host script into RAM and runs it, streaming output until it
/// finishes. Ctrl-C interrupts it on the device.
pub async fn run(session: &Session, file: &Path, soft_reboot: bool) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let ch = session.channel();
    ch.on_receive(to_stdout);

    let script = replink::run_script(ch, &code, soft_reboot);
    tokio::pin!(script);
    let outcome = loop {
        tokio::select! {
            res = &mut script => break res,
            _ = tokio::signal::ctrl_c() => {
                debug!("ctrl-c");
                ch.interrupt().await;
            }
        }
    };
    if outcome.map_err(condense)? == RunOutcome::Interrupted {
        eprintln!("\ninterrupted");
    }
    Ok(())
}

/// Passes stdin lines to the friendly REPL and device output to stdout.
///
/// Ctrl-C interrupts the running program, end of input leaves.
pub async fn interactive(session: &Session) -> Result<()> {
    let ch = session.channel();
    ch.on_receive(to_stdout);
    let (gone_tx, mut gone) = oneshot::channel();
    ch.on_disconnect(move || {
        let _ = gone_tx.send(());
    });

    eprintln!("Connected to {}. Ctrl-C interrupts, Ctrl-D exits.", ch.info());
    ch.write("\r").await;
    passthrough(ch, &mut gone).await
}

/// Pumps stdin into the channel until EOF or disconnect.
async fn passthrough(ch: &Channel, gone: &mut oneshot::Receiver<()>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => ch.write(&enter(&line)).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => ch.interrupt().await,
            _ = &mut *gone => {
                eprintln!("\ndevice disconnected");
                break;
            }
        }
    }
    Ok(())
}

/// Terminates a typed line the way a terminal would.
fn enter(line: &str) -> String {
    format!("{}\r", line.trim_end_matches(['\r', '\n']))
}

/// Writes device output straight to stdout.
fn to_stdout(text: &str) {
    let mut out = std::io::stdout().lock();
    if out.write_all(text.as_bytes()).and_then(|()| out.flush()).is_err() {
        debug!("stdout closed");
    }
}

/// Shows a device exception on stderr and reduces it to a one-line error.
fn explain(e: anyhow::Error) -> anyhow::Error {
    if let Some(Error::Execution(exec)) = e.downcast_ref::<Error>() {
        eprint!("{}", exec.message());
        return anyhow!("{}", summary(exec));
    }
    e
}

/// Reduces a device exception whose traceback was already streamed to a
/// one-line error.
fn condense(e: Error) -> anyhow::Error {
    match &e {
        Error::Execution(exec) => anyhow!("{}", summary(exec)),
        _ => e.into(),
    }
}

/// One-line description of a device exception.
fn summary(exec: &ExecError) -> String {
    exec.traceback().map_or_else(
        || "exception on device".to_owned(),
        |tb| format!("exception: {}", tb.summary()),
    )
}
