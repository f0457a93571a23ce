//! The raw REPL engine: enter, execute, exit.
//!
//! A [`RawRepl`] owns one transaction for its whole lifetime, so nothing
//! else can talk to the device between [`RawRepl::begin`] and
//! [`RawRepl::end`].

mod files;
mod inspect;

use std::time::Duration;

use replink_proto::control::{
    BOOTSTRAP, ENTER_RAW_SEQ, EXECUTE, EXIT_CONFIRM, EXIT_RAW, FRAME_END, INTERRUPT,
    INTERRUPT_TWICE, RAW_BANNER, RAW_PROMPT, SOFT_REBOOT_RAW, STATUS_OK,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use files::WriteOptions;

use crate::transaction::Transaction;
use crate::{Channel, Error, ExecError, Result};

/// Timing knobs for the raw REPL engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RawOptions {
    /// Wait for an idle prompt after each interrupt.
    pub interrupt_interval: Duration,
    /// Total time spent interrupting before giving up on an idle prompt.
    pub interrupt_window: Duration,
    /// Timeout for framing reads (banner, prompt, status).
    pub read_timeout: Duration,
    /// Default timeout for [`RawRepl::exec`].
    pub exec_timeout: Duration,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            interrupt_interval: Duration::from_millis(100),
            interrupt_window: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            exec_timeout: Duration::from_secs(5),
        }
    }
}

/// How a script started with [`run_script`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunOutcome {
    /// The script ran to completion.
    Finished,
    /// The script was stopped by an interrupt.
    Interrupted,
}

/// A raw REPL session holding the channel's transaction lock.
#[derive(Debug)]
pub struct RawRepl<'a> {
    /// Exclusive capture over the channel.
    txn: Transaction<'a>,
    /// Timing knobs.
    options: RawOptions,
    /// Some execution raised on the device.
    had_error: bool,
    /// A framing violation left the device state unknown.
    poisoned: bool,
}

impl<'a> RawRepl<'a> {
    /// Enters raw mode with default options.
    pub async fn begin(channel: &'a Channel, soft_reboot: bool) -> Result<Self> {
        Self::begin_with(channel, soft_reboot, RawOptions::default()).await
    }

    /// Enters raw mode, optionally soft rebooting, and runs the bootstrap.
    ///
    /// On failure the transaction is released and no session is returned.
    pub async fn begin_with(
        channel: &'a Channel,
        soft_reboot: bool,
        options: RawOptions,
    ) -> Result<Self> {
        let mut txn = channel.start_transaction().await?;
        enter(&mut txn, soft_reboot, &options).await?;
        let mut repl = Self {
            txn,
            options,
            had_error: false,
            poisoned: false,
        };
        if let Err(e) = repl.exec(BOOTSTRAP).await {
            if let Err(err) = repl.end().await {
                warn!(error = %err, "leaving raw REPL after failed bootstrap");
            }
            return Err(e);
        }
        Ok(repl)
    }

    /// Executes `code` with the default timeout and no live output.
    pub async fn exec(&mut self, code: &str) -> Result<String> {
        let timeout = Some(self.options.exec_timeout);
        self.exec_with(code, timeout, false).await
    }

    /// Executes `code` and returns its stdout.
    ///
    /// `timeout` bounds the silence while waiting for output (`None` waits
    /// forever). With `emit`, output is also streamed to the channel's
    /// listener as it arrives. Anything printed on stderr is returned as
    /// [`Error::Execution`].
    pub async fn exec_with(
        &mut self,
        code: &str,
        timeout: Option<Duration>,
        emit: bool,
    ) -> Result<String> {
        if self.poisoned {
            return Err(Error::InvalidState("raw REPL session is out of sync"));
        }
        let framing = Some(self.options.read_timeout);
        self.txn.read_until(RAW_PROMPT, framing).await?;
        self.txn.write(code).await;
        self.txn.write(EXECUTE).await;

        let status = self.txn.read_exactly(STATUS_OK.len(), framing).await?;
        if status != STATUS_OK {
            self.poisoned = true;
            return Err(Error::ProtocolViolation(format!("unexpected status {status:?}")));
        }

        if emit {
            self.txn.set_emit(true);
        }
        let frames = self.read_frames(timeout).await;
        if emit {
            self.txn.set_emit(false);
        }
        let (stdout, stderr) = frames?;

        if !stderr.is_empty() {
            self.had_error = true;
            return Err(ExecError::new(stderr).into());
        }
        Ok(stdout)
    }

    /// Reads stdout and stderr, stripping their terminators.
    async fn read_frames(&mut self, timeout: Option<Duration>) -> Result<(String, String)> {
        let mut stdout = self.txn.read_until(FRAME_END, timeout).await?;
        stdout.truncate(stdout.len() - FRAME_END.len());
        let mut stderr = self.txn.read_until(FRAME_END, timeout).await?;
        stderr.truncate(stderr.len() - FRAME_END.len());
        Ok((stdout, stderr))
    }

    /// Whether any execution in this session raised on the device.
    pub const fn had_error(&self) -> bool {
        self.had_error
    }

    /// The channel this session runs on.
    pub const fn channel(&self) -> &'a Channel {
        self.txn.channel()
    }

    /// Leaves raw mode and releases the channel, whatever happens.
    pub async fn end(mut self) -> Result<()> {
        let prompts = self.txn.channel().idle_prompts();
        let framing = Some(self.options.read_timeout);
        let res = async {
            self.txn.write(EXIT_RAW).await;
            self.txn.read_until(EXIT_CONFIRM, framing).await?;
            self.txn.read_until_any(&prompts, framing).await?;
            Ok(())
        }
        .await;
        self.txn.release();
        debug!(ok = res.is_ok(), "left raw REPL");
        res
    }
}

/// Interrupts, finds the idle prompt and switches to raw mode.
async fn enter(txn: &mut Transaction<'_>, soft_reboot: bool, options: &RawOptions) -> Result<()> {
    txn.write(INTERRUPT_TWICE).await;
    if !await_idle_prompt(txn, options).await? {
        debug!("no idle prompt, device may already be in raw mode");
    }
    txn.flush_input();

    txn.write(ENTER_RAW_SEQ).await;
    txn.read_until(RAW_BANNER, Some(options.read_timeout)).await?;
    if soft_reboot {
        debug!("soft reboot");
        txn.write(SOFT_REBOOT_RAW).await;
        txn.read_until(RAW_BANNER, Some(options.read_timeout)).await?;
    }
    debug!("entered raw REPL");
    Ok(())
}

/// Sends interrupts until an idle prompt shows up or the window closes.
///
/// Program output seen meanwhile is forwarded to the listener.
async fn await_idle_prompt(txn: &mut Transaction<'_>, options: &RawOptions) -> Result<bool> {
    let channel = txn.channel();
    let prompts = channel.idle_prompts();
    let deadline = tokio::time::Instant::now() + options.interrupt_window;
    loop {
        txn.write(INTERRUPT).await;
        let wait = txn.read_until_any(&prompts, None);
        match tokio::time::timeout(options.interrupt_interval, wait).await {
            Ok(Ok((text, idx))) => {
                let before = &text[..text.len() - prompts[idx].len()];
                if !is_noise(before, &prompts) {
                    txn.forward(before);
                }
                channel.remember_prompt(&prompts[idx]);
                return Ok(true);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let pending = txn.take_pending();
                txn.forward(&pending);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
    }
}

/// Text made only of prompts and whitespace.
fn is_noise(text: &str, prompts: &[String]) -> bool {
    let mut rest = text.to_owned();
    for p in prompts {
        rest = rest.replace(p.as_str(), "");
    }
    rest.trim().is_empty()
}

/// Runs `code` in raw mode, streaming its output to the channel's listener.
///
/// No timeout applies; an interrupt ends the script with
/// [`RunOutcome::Interrupted`]. Raw mode is always left afterwards.
pub async fn run_script(channel: &Channel, code: &str, soft_reboot: bool) -> Result<RunOutcome> {
    let mut repl = RawRepl::begin(channel, soft_reboot).await?;
    let res = repl.exec_with(code, None, true).await;
    let ended = repl.end().await;
    match res {
        Ok(_) => ended.map(|()| RunOutcome::Finished),
        Err(e) if e.is_interrupt() => ended.map(|()| RunOutcome::Interrupted),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::lock;
    use crate::link::fake::{FakeHandle, FakeLink};

    pub(super) async fn setup() -> (Channel, FakeHandle) {
        let (link, dev) = FakeLink::new();
        let ch = Channel::new(Box::new(link));
        ch.connect().await.unwrap();
        (ch, dev)
    }

    fn recorder(ch: &Channel) -> Arc<Mutex<String>> {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        ch.on_receive(move |t| lock(&sink).push_str(t));
        seen
    }

    #[tokio::test]
    async fn exec_print_returns_printed_text() {
        let (ch, dev) = setup().await;
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        assert!(dev.with(|d| d.raw));
        assert_eq!(repl.exec("print('hello')").await.unwrap(), "hello\r\n");
        assert_eq!(repl.exec("x = 1").await.unwrap(), "");
        assert!(!repl.had_error());
        repl.end().await.unwrap();
        assert!(!dev.with(|d| d.raw));
        assert_eq!(ch.prompt().as_deref(), Some(">>> "));
    }

    #[tokio::test]
    async fn exec_raise_yields_execution_error() {
        let (ch, _dev) = setup().await;
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        let err = repl.exec("raise ValueError('boom')").await.unwrap_err();
        let Error::Execution(exec) = err else {
            panic!("unexpected {err:?}");
        };
        assert!(exec.message().contains("ValueError: boom"));
        assert_eq!(exec.traceback().unwrap().kind, "ValueError");
        assert!(repl.had_error());
        assert_eq!(repl.exec("print('still alive')").await.unwrap(), "still alive\r\n");
        repl.end().await.unwrap();
    }

    #[tokio::test]
    async fn end_releases_lock_after_failed_exec() {
        let (ch, _dev) = setup().await;
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        assert!(repl.exec("raise OSError('x')").await.is_err());
        repl.end().await.unwrap();
        let repl = RawRepl::begin(&ch, false).await.unwrap();
        repl.end().await.unwrap();
    }

    #[tokio::test]
    async fn bad_status_poisons_session() {
        let (ch, dev) = setup().await;
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        dev.with(|d| d.bad_status = Some("XX"));
        let err = repl.exec("print(1)").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(ref s) if s.contains("XX")));
        assert!(matches!(repl.exec("print(1)").await, Err(Error::InvalidState(_))));
        drop(repl);
        assert!(ch.start_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn failed_bootstrap_releases_lock() {
        let (ch, dev) = setup().await;
        dev.with(|d| d.fail_on = Some("import sys,os".into()));
        let err = RawRepl::begin(&ch, false).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));
        assert!(!dev.with(|d| d.raw));
        assert!(ch.start_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn soft_reboot_on_entry() {
        let (ch, dev) = setup().await;
        let repl = RawRepl::begin(&ch, true).await.unwrap();
        assert_eq!(dev.with(|d| d.soft_reboots), 1);
        repl.end().await.unwrap();
    }

    #[tokio::test]
    async fn stale_banner_before_entry_converges() {
        let (ch, dev) = setup().await;
        dev.with(|d| d.stale = Some(format!("{RAW_BANNER}>OK\x04\x04>{RAW_BANNER}")));
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        assert_eq!(repl.exec("print('fresh')").await.unwrap(), "fresh\r\n");
        repl.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn device_already_in_raw_mode() {
        let (ch, dev) = setup().await;
        dev.with(|d| d.raw = true);
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        assert_eq!(repl.exec("print('ok')").await.unwrap(), "ok\r\n");
        repl.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn busy_output_is_forwarded_while_interrupting() {
        let (ch, dev) = setup().await;
        let seen = recorder(&ch);
        dev.with(|d| d.busy = 3);
        let repl = RawRepl::begin(&ch, false).await.unwrap();
        repl.end().await.unwrap();
        assert!(lock(&seen).contains("tick\r\n"));
    }

    #[tokio::test]
    async fn alternate_prompt_is_detected_and_remembered() {
        let (ch, dev) = setup().await;
        dev.with(|d| d.prompt = "--> ".into());
        let repl = RawRepl::begin(&ch, false).await.unwrap();
        repl.end().await.unwrap();
        assert_eq!(ch.prompt().as_deref(), Some("--> "));
        assert_eq!(ch.idle_prompts()[0], "--> ");
    }

    #[tokio::test]
    async fn emit_streams_output_to_listener() {
        let (ch, _dev) = setup().await;
        let mut repl = RawRepl::begin(&ch, false).await.unwrap();
        let seen = recorder(&ch);
        let out = repl.exec_with("print('live')", None, true).await.unwrap();
        assert_eq!(out, "live\r\n");
        assert!(lock(&seen).starts_with("live\r\n\x04"));
        repl.exec("print('quiet')").await.unwrap();
        assert!(!lock(&seen).contains("quiet"));
        repl.end().await.unwrap();
    }

    #[tokio::test]
    async fn run_script_maps_interrupt() {
        let (ch, dev) = setup().await;
        let stop = async {
            // bootstrap plus the script itself
            while dev.with(|d| d.execs) < 2 {
                tokio::task::yield_now().await;
            }
            ch.interrupt().await;
        };
        let (outcome, ()) = tokio::join!(run_script(&ch, "while True: pass", false), stop);
        assert_eq!(outcome.unwrap(), RunOutcome::Interrupted);
        assert!(ch.start_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn run_script_finishes() {
        let (ch, _dev) = setup().await;
        let seen = recorder(&ch);
        let outcome = run_script(&ch, "print('done')", false).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert!(lock(&seen).contains("done"));
    }

    #[test]
    fn noise_detection() {
        let prompts = vec![">>> ".to_owned(), "--> ".to_owned()];
        assert!(is_noise("\r\n>>> \r\n", &prompts));
        assert!(!is_noise("hello\r\n", &prompts));
    }
}
