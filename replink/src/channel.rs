//! A device link plus the receive side shared with its pump.
//!
//! Inbound bytes are decoded as UTF-8 and routed either to the installed
//! listener or, while a [`Transaction`] is open, into its capture buffer.
//! Reads wait on a `watch` generation counter that the pump bumps on every
//! growth.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use replink_proto::control::{
    IDLE_PROMPTS, INTERRUPT_TWICE, RebootMode, SOFT_REBOOT, WEBREPL_CONNECTED, WEBREPL_DENIED,
    WEBREPL_PASSWORD,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::link::{ConnState, Handshake, Link, LinkInfo};
use crate::transaction::Transaction;
use crate::{Error, Result};

/// Receives decoded text outside transactions.
type Listener = Box<dyn FnMut(&str) + Send>;
/// Fired on every inbound and outbound chunk.
type ActivityHook = Arc<dyn Fn() + Send + Sync>;
/// Fired once when the link goes down.
type DisconnectHook = Box<dyn FnOnce() + Send>;

/// Timeout for each line of the WebREPL login reply.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Locks `m`, ignoring poisoning.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Incremental UTF-8 decoder that carries split sequences across calls.
#[derive(Debug, Default)]
pub(crate) struct Utf8Stream {
    /// Incomplete trailing sequence from the previous call.
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Decodes `bytes`, replacing invalid sequences with U+FFFD.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);
        let mut out = String::with_capacity(data.len());
        let mut rest = data.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    if let Some(bad) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[bad..];
                    } else {
                        self.pending = after.to_vec();
                        break;
                    }
                }
            }
        }
        out
    }
}

/// Text captured by an open transaction.
#[derive(Debug, Default)]
pub(crate) struct Capture {
    /// Arrivals not yet consumed by a read.
    pub(crate) buf: String,
    /// Forward arrivals live to the listener.
    pub(crate) emit: bool,
    /// Byte offset in `buf` up to which text has been forwarded.
    pub(crate) emitted: usize,
}

impl Capture {
    /// Removes and returns the first `end` bytes.
    pub(crate) fn take_prefix(&mut self, end: usize) -> String {
        self.emitted = self.emitted.saturating_sub(end);
        self.buf.drain(..end).collect()
    }
}

/// Listener and capture buffer, guarded together.
#[derive(Default)]
pub(crate) struct Inbox {
    /// Installed receive hook.
    listener: Option<Listener>,
    /// Present while a transaction is open.
    pub(crate) capture: Option<Capture>,
    /// Inbound decoder state.
    decoder: Utf8Stream,
}

impl Inbox {
    /// Hands `text` to the listener.
    pub(crate) fn forward(&mut self, text: &str) {
        if let (false, Some(listener)) = (text.is_empty(), self.listener.as_mut()) {
            listener(text);
        }
    }

    /// Forwards captured text that has not been forwarded yet.
    pub(crate) fn flush_unemitted(&mut self) {
        let Self { listener, capture, .. } = self;
        let Some(capture) = capture.as_mut() else {
            return;
        };
        let tail = &capture.buf[capture.emitted..];
        if let (false, Some(listener)) = (tail.is_empty(), listener.as_mut()) {
            listener(tail);
        }
        capture.emitted = capture.buf.len();
    }

    /// Routes freshly decoded text.
    fn route(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let Self { listener, capture, .. } = self;
        match capture {
            Some(capture) => {
                capture.buf.push_str(text);
                if capture.emit {
                    if let Some(listener) = listener.as_mut() {
                        listener(text);
                    }
                    capture.emitted = capture.buf.len();
                }
            }
            None => {
                if let Some(listener) = listener.as_mut() {
                    listener(text);
                }
            }
        }
    }
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("listener", &self.listener.is_some())
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

/// State shared between a [`Channel`] and its link's pump.
pub(crate) struct Shared {
    /// Receive side.
    inbox: Mutex<Inbox>,
    /// Bumped whenever the capture buffer grows or the link closes.
    grew: watch::Sender<u64>,
    /// Set once when the link goes down.
    closed: AtomicBool,
    /// Connection state.
    state: Mutex<ConnState>,
    /// Activity indicator hook.
    activity: Mutex<Option<ActivityHook>>,
    /// Disconnect hook, taken when fired.
    on_disconnect: Mutex<Option<DisconnectHook>>,
}

impl Shared {
    /// Fresh receive side with no hooks.
    fn new() -> Self {
        let (grew, _) = watch::channel(0);
        Self {
            inbox: Mutex::new(Inbox::default()),
            grew,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnState::Disconnected),
            activity: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        }
    }

    /// Runs `f` with the inbox locked.
    pub(crate) fn with_inbox<T>(&self, f: impl FnOnce(&mut Inbox) -> T) -> T {
        f(&mut lock(&self.inbox))
    }

    /// Subscribes to buffer growth.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.grew.subscribe()
    }

    /// Whether the link has gone down.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fires the activity hook.
    fn activity(&self) {
        let hook = lock(&self.activity).clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Decodes and routes inbound bytes.
    fn deliver(&self, bytes: &[u8]) {
        let grew = {
            let mut inbox = lock(&self.inbox);
            let text = inbox.decoder.decode(bytes);
            inbox.route(&text);
            !text.is_empty() && inbox.capture.is_some()
        };
        trace!(bytes = bytes.len(), "received");
        if grew {
            self.grew.send_modify(|g| *g = g.wrapping_add(1));
        }
        self.activity();
    }

    /// Marks the link closed, wakes waiting reads and fires the disconnect hook once.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *lock(&self.state) = ConnState::Disconnected;
        self.grew.send_modify(|g| *g = g.wrapping_add(1));
        let hook = lock(&self.on_disconnect).take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("closed", &self.is_closed())
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

/// Handle a link's pump uses to push inbound data.
#[derive(Clone)]
pub struct Sink {
    /// Receive side of the owning channel.
    shared: Arc<Shared>,
}

impl Sink {
    /// Pushes raw inbound bytes.
    pub fn deliver(&self, bytes: &[u8]) {
        self.shared.deliver(bytes);
    }

    /// Reports that the link went down. Only the first call has an effect.
    pub fn closed(&self) {
        self.shared.close();
    }

    /// Whether the channel already considers the link closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A sink not attached to any channel.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

/// One physical or logical connection to a device.
///
/// Created for a single connect; once disconnected it is discarded.
#[derive(Debug)]
pub struct Channel {
    /// The backend.
    link: tokio::sync::Mutex<Box<dyn Link>>,
    /// Receive side shared with the pump.
    shared: Arc<Shared>,
    /// Serialises transactions in request order.
    txn_lock: tokio::sync::Mutex<()>,
    /// Result of the last `request_access`.
    info: Mutex<LinkInfo>,
    /// Idle prompt detected on this device.
    prompt: Mutex<Option<String>>,
    /// Backend name for logs.
    name: &'static str,
}

impl Channel {
    /// Wraps a link. Nothing is opened until [`connect`](Self::connect).
    pub fn new(link: Box<dyn Link>) -> Self {
        let name = link.name();
        Self {
            link: tokio::sync::Mutex::new(link),
            shared: Arc::new(Shared::new()),
            txn_lock: tokio::sync::Mutex::new(()),
            info: Mutex::new(LinkInfo::new(name)),
            prompt: Mutex::new(None),
            name,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *lock(&self.shared.state)
    }

    /// What is known about the device.
    pub fn info(&self) -> LinkInfo {
        lock(&self.info).clone()
    }

    /// Whether the link has gone down.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Idle prompt detected on this device, if any.
    pub fn prompt(&self) -> Option<String> {
        lock(&self.prompt).clone()
    }

    /// Remembers the idle prompt the device answered with.
    pub(crate) fn remember_prompt(&self, prompt: &str) {
        let mut slot = lock(&self.prompt);
        if slot.as_deref() != Some(prompt) {
            debug!(link = self.name, prompt, "idle prompt detected");
            *slot = Some(prompt.to_owned());
        }
    }

    /// Idle prompts to look for, the remembered one first.
    pub(crate) fn idle_prompts(&self) -> Vec<String> {
        let mut prompts: Vec<String> = self.prompt().into_iter().collect();
        for p in IDLE_PROMPTS {
            if !prompts.iter().any(|q| q == p) {
                prompts.push((*p).to_owned());
            }
        }
        prompts
    }

    /// Receive side shared with the pump.
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Resolves the device behind the link.
    pub async fn request_access(&self) -> Result<LinkInfo> {
        let info = self.link.lock().await.request_access().await?;
        debug!(link = self.name, %info, "access granted");
        lock(&self.info).clone_from(&info);
        Ok(info)
    }

    /// Opens the link and runs the backend's handshake.
    ///
    /// A failed login disconnects the link before the error is returned.
    pub async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidState("channel was disconnected"));
        }
        let handshake = self.link.lock().await.handshake();
        handshake.check()?;

        {
            let mut state = lock(&self.shared.state);
            if *state != ConnState::Disconnected {
                return Err(Error::InvalidState("already connected"));
            }
            *state = ConnState::Connecting;
        }
        // Capture from the first byte so the login prompt cannot be missed.
        let login = match handshake {
            Handshake::None => None,
            _ => Some(self.open_transaction().await),
        };
        let sink = Sink {
            shared: Arc::clone(&self.shared),
        };
        if let Err(e) = self.link.lock().await.connect(sink).await {
            drop(login);
            *lock(&self.shared.state) = ConnState::Disconnected;
            return Err(e);
        }
        if !self.is_closed() {
            *lock(&self.shared.state) = ConnState::Connected;
        }
        debug!(link = self.name, "connected");

        if let (Some(txn), Handshake::WebRepl { password, prompt_timeout }) = (login, handshake) {
            if let Err(e) = webrepl_login(txn, password.as_deref(), prompt_timeout).await {
                if let Err(err) = self.disconnect().await {
                    warn!(link = self.name, error = %err, "disconnect after failed login");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stops the pump and releases the device. Safe to call at any point.
    pub async fn disconnect(&self) -> Result<()> {
        let res = self.link.lock().await.disconnect().await;
        self.shared.close();
        debug!(link = self.name, "disconnected");
        res
    }

    /// Sends `text` in chunks no larger than the link allows.
    ///
    /// Chunks are split on character boundaries and paced by the link.
    /// Failures are logged, not returned.
    pub async fn write(&self, text: &str) {
        let mut link = self.link.lock().await;
        let pacing = link.pacing();
        for (i, chunk) in split_chunks(text, link.max_chunk()).into_iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            if let Err(e) = link.send(chunk.as_bytes()).await {
                warn!(link = self.name, error = %e, "write failed");
                return;
            }
            trace!(link = self.name, bytes = chunk.len(), "sent");
            self.shared.activity();
        }
    }

    /// Opens an exclusive capture window, waiting behind earlier callers.
    pub async fn start_transaction(&self) -> Result<Transaction<'_>> {
        if self.state() != ConnState::Connected {
            return Err(Error::InvalidState("not connected"));
        }
        let txn = self.open_transaction().await;
        if self.is_closed() {
            return Err(Error::InvalidState("not connected"));
        }
        Ok(txn)
    }

    /// Acquires the transaction lock without checking the state.
    async fn open_transaction(&self) -> Transaction<'_> {
        let guard = self.txn_lock.lock().await;
        Transaction::new(self, guard)
    }

    /// Interrupts the running program. Does not wait for a transaction.
    pub async fn interrupt(&self) {
        debug!(link = self.name, "interrupt");
        self.write(INTERRUPT_TWICE).await;
    }

    /// Reboots the device from the friendly REPL.
    pub async fn reboot(&self, mode: RebootMode) -> Result<()> {
        let txn = self.start_transaction().await?;
        debug!(link = self.name, %mode, "reboot");
        match mode.statement() {
            None => txn.write(SOFT_REBOOT).await,
            Some(statement) => {
                txn.write(INTERRUPT_TWICE).await;
                txn.write(statement).await;
            }
        }
        txn.release();
        Ok(())
    }

    /// Installs the receive hook, replacing any previous one.
    pub fn on_receive(&self, f: impl FnMut(&str) + Send + 'static) {
        self.shared.with_inbox(|inbox| inbox.listener = Some(Box::new(f)));
    }

    /// Installs the activity hook.
    pub fn on_activity(&self, f: impl Fn() + Send + Sync + 'static) {
        *lock(&self.shared.activity) = Some(Arc::new(f));
    }

    /// Installs the disconnect hook. It fires at most once.
    pub fn on_disconnect(&self, f: impl FnOnce() + Send + 'static) {
        *lock(&self.shared.on_disconnect) = Some(Box::new(f));
    }
}

/// Splits `text` into pieces of at most `limit` bytes on char boundaries.
fn split_chunks(text: &str, limit: Option<usize>) -> Vec<&str> {
    let Some(limit) = limit.filter(|&l| l > 0) else {
        return if text.is_empty() { Vec::new() } else { vec![text] };
    };
    let mut chunks = Vec::with_capacity(text.len() / limit + 1);
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = limit.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

/// WebREPL password exchange, run as the first transaction.
async fn webrepl_login(
    mut txn: Transaction<'_>,
    password: Option<&str>,
    prompt_timeout: Duration,
) -> Result<()> {
    match txn.read_until(WEBREPL_PASSWORD, Some(prompt_timeout)).await {
        Ok(_) => {}
        Err(Error::Timeout(_)) => {
            debug!("no password prompt, assuming open WebREPL");
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    let Some(password) = password else {
        return Err(Error::AccessDenied("password required".into()));
    };
    txn.write(&format!("{password}\n")).await;
    txn.read_until("\n", Some(LOGIN_TIMEOUT)).await?;
    let reply = txn.read_until("\n", Some(LOGIN_TIMEOUT)).await?;
    match reply.trim() {
        WEBREPL_CONNECTED => {
            debug!("WebREPL login accepted");
            Ok(())
        }
        WEBREPL_DENIED => Err(Error::AccessDenied("invalid password".into())),
        other => Err(Error::ConnectFailed(other.to_owned())),
    }
}
