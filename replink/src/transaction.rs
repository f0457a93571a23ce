//! Exclusive, time-bounded capture sessions over a [`Channel`].

use std::time::Duration;

use tokio::sync::{MutexGuard, watch};

use crate::channel::{Capture, Channel};
use crate::{Error, Result};

/// Exclusive capture window over a channel's inbound text.
///
/// While open, everything the device sends is appended to a buffer that the
/// read methods consume. Dropping or [releasing](Self::release) the
/// transaction forwards whatever was not forwarded yet to the channel's
/// listener and lets the next caller in.
///
/// Every read takes an optional timeout that is re-armed whenever new text
/// arrives; `None` waits forever.
#[derive(Debug)]
pub struct Transaction<'a> {
    /// Owning channel.
    channel: &'a Channel,
    /// Growth notifications.
    grew: watch::Receiver<u64>,
    /// Set once the capture has been torn down.
    released: bool,
    /// Held until the transaction ends.
    _guard: MutexGuard<'a, ()>,
}

impl<'a> Transaction<'a> {
    /// Installs a fresh capture buffer. The caller holds the channel's lock.
    pub(crate) fn new(channel: &'a Channel, guard: MutexGuard<'a, ()>) -> Self {
        let shared = channel.shared();
        shared.with_inbox(|inbox| inbox.capture = Some(Capture::default()));
        Self {
            channel,
            grew: shared.subscribe(),
            released: false,
            _guard: guard,
        }
    }

    /// The channel this transaction runs on.
    pub const fn channel(&self) -> &'a Channel {
        self.channel
    }

    /// Runs `f` on the capture buffer.
    fn with_capture<T>(&self, f: impl FnOnce(&mut Capture) -> T) -> Result<T> {
        self.channel
            .shared()
            .with_inbox(|inbox| inbox.capture.as_mut().map(f))
            .ok_or(Error::InvalidState("transaction already released"))
    }

    /// Discards buffered text.
    pub fn flush_input(&mut self) {
        let _ = self.with_capture(|c| {
            c.buf.clear();
            c.emitted = 0;
        });
    }

    /// Drains and returns everything buffered.
    pub fn take_pending(&mut self) -> String {
        self.with_capture(|c| {
            c.emitted = 0;
            std::mem::take(&mut c.buf)
        })
        .unwrap_or_default()
    }

    /// Copy of the buffered text, left in place.
    pub fn pending(&self) -> String {
        self.with_capture(|c| c.buf.clone()).unwrap_or_default()
    }

    /// Hands `text` to the listener this transaction displaced.
    pub fn forward(&self, text: &str) {
        self.channel.shared().with_inbox(|inbox| inbox.forward(text));
    }

    /// Switches live forwarding of captured text.
    ///
    /// Turning it on first forwards buffered text that has not been
    /// forwarded yet. Text is never forwarded twice.
    pub fn set_emit(&mut self, on: bool) {
        self.channel.shared().with_inbox(|inbox| {
            if let Some(capture) = inbox.capture.as_mut() {
                capture.emit = on;
            }
            if on {
                inbox.flush_unemitted();
            }
        });
    }

    /// Sends `text` through the channel.
    pub async fn write(&self, text: &str) {
        self.channel.write(text).await;
    }

    /// Waits for `n` characters and returns exactly those.
    pub async fn read_exactly(&mut self, n: usize, timeout: Option<Duration>) -> Result<String> {
        self.wait_for(timeout, |c| {
            let end = match c.buf.char_indices().nth(n) {
                Some((end, _)) => end,
                None if c.buf.chars().count() == n => c.buf.len(),
                None => return None,
            };
            Some(c.take_prefix(end))
        })
        .await
    }

    /// Waits for `marker` and returns everything up to and including it.
    pub async fn read_until(&mut self, marker: &str, timeout: Option<Duration>) -> Result<String> {
        self.read_until_any(&[marker], timeout).await.map(|(text, _)| text)
    }

    /// Waits for any of `markers`.
    ///
    /// Returns the text through the match that ends first, together with the
    /// index of the matched marker.
    pub async fn read_until_any<S: AsRef<str>>(
        &mut self,
        markers: &[S],
        timeout: Option<Duration>,
    ) -> Result<(String, usize)> {
        if markers.is_empty() || markers.iter().any(|m| m.as_ref().is_empty()) {
            return Err(Error::InvalidState("empty read marker"));
        }
        self.wait_for(timeout, |c| {
            let (end, idx) = markers
                .iter()
                .enumerate()
                .filter_map(|(i, m)| {
                    let m = m.as_ref();
                    c.buf.find(m).map(|pos| (pos + m.len(), i))
                })
                .min()?;
            Some((c.take_prefix(end), idx))
        })
        .await
    }

    /// Polls `take` after every growth of the buffer until it yields.
    async fn wait_for<T>(
        &mut self,
        timeout: Option<Duration>,
        mut take: impl FnMut(&mut Capture) -> Option<T>,
    ) -> Result<T> {
        loop {
            self.grew.mark_unchanged();
            if let Some(value) = self.with_capture(&mut take)? {
                return Ok(value);
            }
            if self.channel.shared().is_closed() {
                return Err(Error::Closed);
            }
            let changed = self.grew.changed();
            let woke = match timeout {
                None => changed.await,
                Some(window) => tokio::time::timeout(window, changed)
                    .await
                    .map_err(|_| Error::Timeout(window))?,
            };
            if woke.is_err() {
                return Err(Error::Closed);
            }
        }
    }

    /// Ends the transaction.
    pub fn release(mut self) {
        self.finish();
    }

    /// Flushes unforwarded text and removes the capture.
    fn finish(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.channel.shared().with_inbox(|inbox| {
            inbox.flush_unemitted();
            inbox.capture = None;
        });
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::lock;
    use crate::link::fake::{FakeHandle, FakeLink};

    async fn setup() -> (Channel, FakeHandle) {
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
    async fn buffer_keeps_arrival_order() {
        let (ch, dev) = setup().await;
        let mut txn = ch.start_transaction().await.unwrap();
        for part in ["a", "bc", "", "def", "\u{e9}"] {
            dev.inject(part);
        }
        assert_eq!(txn.pending(), "abcdef\u{e9}");
        assert_eq!(txn.read_exactly(3, None).await.unwrap(), "abc");
        assert_eq!(txn.read_exactly(4, None).await.unwrap(), "def\u{e9}");
    }

    #[tokio::test]
    async fn read_until_ends_with_marker() {
        let (ch, dev) = setup().await;
        let mut txn = ch.start_transaction().await.unwrap();
        dev.inject("noise>>> more");
        let got = txn.read_until(">>> ", Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(got, "noise>>> ");
        assert_eq!(txn.pending(), "more");
    }

    #[tokio::test]
    async fn read_until_any_picks_earliest_end() {
        let (ch, dev) = setup().await;
        let mut txn = ch.start_transaction().await.unwrap();
        dev.inject("xx--> yy>>> ");
        let (text, idx) = txn.read_until_any(&[">>> ", "--> "], None).await.unwrap();
        assert_eq!((text.as_str(), idx), ("xx--> ", 1));
        assert!(matches!(
            txn.read_until_any::<&str>(&[], None).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(txn.read_until("", None).await, Err(Error::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_resets_on_growth() {
        let (ch, dev) = setup().await;
        let mut txn = ch.start_transaction().await.unwrap();
        let window = Duration::from_millis(100);
        let feeder = async {
            for _ in 0..10 {
                tokio::time::sleep(window / 2).await;
                dev.inject(".");
            }
            dev.inject("END");
        };
        let (got, ()) = tokio::join!(txn.read_until("END", Some(window)), feeder);
        assert_eq!(got.unwrap(), "..........END");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_keeps_buffer() {
        let (ch, dev) = setup().await;
        let mut txn = ch.start_transaction().await.unwrap();
        dev.inject("partial");
        let window = Duration::from_millis(100);
        let err = txn.read_until("END", Some(window)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(w) if w == window));
        assert_eq!(txn.pending(), "partial");
    }

    #[tokio::test]
    async fn read_fails_when_link_closes() {
        let (ch, dev) = setup().await;
        let mut txn = ch.start_transaction().await.unwrap();
        let hang_up = async {
            tokio::task::yield_now().await;
            dev.hang_up();
        };
        let (got, ()) = tokio::join!(txn.read_until("never", None), hang_up);
        assert!(matches!(got, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn transactions_are_exclusive_and_fifo() {
        let (ch, _dev) = setup().await;
        let first = ch.start_transaction().await.unwrap();
        let second = ch.start_transaction();
        tokio::pin!(second);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut second).await.is_err());
        first.release();
        let second = second.await.unwrap();
        drop(second);
        assert!(ch.start_transaction().await.is_ok());
    }

    #[tokio::test]
    async fn release_forwards_unconsumed_text_once() {
        let (ch, dev) = setup().await;
        let seen = recorder(&ch);
        let mut txn = ch.start_transaction().await.unwrap();
        dev.inject("abc");
        txn.set_emit(true);
        dev.inject("def");
        txn.set_emit(false);
        dev.inject("ghi");
        txn.read_exactly(2, None).await.unwrap();
        assert_eq!(*lock(&seen), "abcdef");
        txn.release();
        assert_eq!(*lock(&seen), "abcdefghi");
        dev.inject("!");
        assert_eq!(*lock(&seen), "abcdefghi!");
    }

    #[tokio::test]
    async fn consumed_text_is_not_forwarded() {
        let (ch, dev) = setup().await;
        let seen = recorder(&ch);
        let mut txn = ch.start_transaction().await.unwrap();
        dev.inject("OK tail");
        txn.read_exactly(2, None).await.unwrap();
        txn.flush_input();
        dev.inject("rest");
        assert_eq!(txn.take_pending(), "rest");
        drop(txn);
        assert_eq!(*lock(&seen), "");
    }
}
