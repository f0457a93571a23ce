//! In-memory MicroPython board for tests.
//!
//! Understands the friendly and raw REPL control bytes, the WebREPL login and
//! just enough of the generated scripts to keep a small filesystem.
//! Output is delivered synchronously from [`Link::send`].

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::missing_docs_in_private_items)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replink_proto::control::RAW_BANNER;
use replink_proto::{hexlify, script};
use sha2::{Digest, Sha256};

use super::{Handshake, Link, LinkInfo};
use crate::channel::Sink;
use crate::{Error, Result};

/// Simulated device state.
#[derive(Debug)]
pub(crate) struct Device {
    pub raw: bool,
    pub prompt: String,
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    /// Any exec whose code contains this raises `OSError`.
    pub fail_on: Option<String>,
    /// Interrupts answered with program output instead of a prompt.
    pub busy: usize,
    pub silent_interrupts: bool,
    /// Printed once on the first interrupt.
    pub stale: Option<String>,
    pub password: Option<String>,
    pub no_hashlib: bool,
    /// Status sent instead of `OK`.
    pub bad_status: Option<&'static str>,
    pub refuse_connect: bool,
    pub soft_reboots: usize,
    /// Lines typed into the friendly REPL.
    pub typed: Vec<String>,
    /// Every chunk received, in order.
    pub chunks: Vec<Vec<u8>>,
    /// Number of execs run in raw mode.
    pub execs: usize,
    code: String,
    line: String,
    login: Option<String>,
    running: bool,
    open: Option<(String, Vec<u8>)>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            raw: false,
            prompt: ">>> ".into(),
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            fail_on: None,
            busy: 0,
            silent_interrupts: false,
            stale: None,
            password: None,
            no_hashlib: false,
            bad_status: None,
            refuse_connect: false,
            soft_reboots: 0,
            typed: Vec::new(),
            chunks: Vec::new(),
            execs: 0,
            code: String::new(),
            line: String::new(),
            login: None,
            running: false,
            open: None,
        }
    }
}

impl Device {
    fn feed(&mut self, input: &str) -> String {
        let mut out = String::new();
        for c in input.chars() {
            if let Some(buf) = self.login.as_mut() {
                if c == '\n' {
                    let attempt = std::mem::take(buf);
                    self.login = None;
                    out.push_str("\r\n");
                    if Some(attempt.as_str()) == self.password.as_deref() {
                        out.push_str("WebREPL connected\r\n");
                        out.push_str(&self.prompt);
                    } else {
                        out.push_str("Access denied\r\n");
                    }
                } else {
                    buf.push(c);
                }
            } else if self.raw {
                self.raw_char(c, &mut out);
            } else {
                self.friendly_char(c, &mut out);
            }
        }
        out
    }

    fn friendly_char(&mut self, c: char, out: &mut String) {
        match c {
            '\x03' => {
                self.line.clear();
                if let Some(s) = self.stale.take() {
                    out.push_str(&s);
                }
                if self.busy > 0 {
                    self.busy -= 1;
                    out.push_str("tick\r\n");
                } else if !self.silent_interrupts {
                    out.push_str("\r\n");
                    out.push_str(&self.prompt);
                }
            }
            '\x01' => {
                self.raw = true;
                self.code.clear();
                out.push_str(RAW_BANNER);
                out.push('>');
            }
            '\x04' => {
                self.soft_reboots += 1;
                out.push_str("MPY: soft reboot\r\nMicroPython fake\r\n");
                out.push_str(&self.prompt);
            }
            '\r' | '\n' => {
                if !self.line.is_empty() {
                    self.typed.push(std::mem::take(&mut self.line));
                }
            }
            c => self.line.push(c),
        }
    }

    fn raw_char(&mut self, c: char, out: &mut String) {
        match c {
            '\x03' if self.running => {
                self.running = false;
                out.push('\x04');
                out.push_str(&traceback("KeyboardInterrupt", ""));
                out.push_str("\x04>");
            }
            _ if self.running => {}
            '\x01' => {
                self.code.clear();
                out.push_str(RAW_BANNER);
                out.push('>');
            }
            '\x02' => {
                self.raw = false;
                out.push_str("\r\nMicroPython fake; Fake board\r\n");
                out.push_str("Type \"help()\" for more information.\r\n");
                out.push_str(&self.prompt);
            }
            '\x03' => self.code.clear(),
            '\x04' if self.code.is_empty() => {
                self.soft_reboots += 1;
                out.push_str("OK\r\nMPY: soft reboot\r\n");
                out.push_str(RAW_BANNER);
                out.push('>');
            }
            '\x04' => {
                let code = std::mem::take(&mut self.code);
                self.execs += 1;
                if let Some(status) = self.bad_status {
                    out.push_str(status);
                    return;
                }
                out.push_str("OK");
                if code.trim() == "while True: pass" {
                    self.running = true;
                    return;
                }
                let (stdout, stderr) = self.run(&code);
                out.push_str(&stdout);
                out.push('\x04');
                out.push_str(&stderr);
                out.push_str("\x04>");
            }
            c => self.code.push(c),
        }
    }

    fn run(&mut self, code: &str) -> (String, String) {
        if code.starts_with("f.close()") {
            return self.close(code);
        }
        if self.fails(code) {
            return (String::new(), traceback("OSError", "[Errno 5] EIO"));
        }
        if code.contains("o=f.write") {
            let (path, _) = literal_after(code, "f=open(").unwrap();
            self.open = Some((path, Vec::new()));
            return ok();
        }
        if let Some(hex) = code.strip_prefix("w('") {
            let data = replink_proto::decode_hex(hex.trim_end_matches("')")).unwrap();
            return self.append(&data);
        }
        if let Some(lit) = code.strip_prefix("o(b") {
            let (data, _) = py_literal(lit).unwrap();
            return self.append(&data);
        }
        if code == script::ABORT_WRITE {
            self.open = None;
            return ok();
        }
        if code.contains("hashlib") {
            if self.no_hashlib {
                return (format!("{}\r\n", script::NO_HASHLIB), String::new());
            }
            let (path, _) = literal_after(code, "open(").unwrap();
            return match self.files.get(&path) {
                Some(data) => {
                    let digest = hexlify(Sha256::digest(data).as_slice());
                    (format!("{digest}\r\n"), String::new())
                }
                None => (String::new(), traceback("OSError", "[Errno 2] ENOENT")),
            };
        }
        if code.contains("'rb') as f") {
            let (path, _) = literal_after(code, "open(").unwrap();
            return match self.files.get(&path) {
                Some(data) => (hexlify(data), String::new()),
                None => (String::new(), traceback("OSError", "[Errno 2] ENOENT")),
            };
        }
        if code == script::DEVICE_INFO {
            return (
                "Fake board with FAKE|1.23.0|fake|MicroPython v1.23.0 on 2024-06-02\
                 |6|2|10|:.frozen:/lib\r\n"
                    .into(),
                String::new(),
            );
        }
        if code.starts_with("s=os.statvfs(") {
            return ("8192|1040384|1048576\r\n".into(), String::new());
        }
        if code == script::WALK_FS {
            return (self.walk(), String::new());
        }
        if code.contains("os.mkdir(p)") {
            let (path, _) = literal_after(code, "for d in [x for x in ").unwrap();
            let mut prefix = String::new();
            for seg in path.split('/').filter(|s| !s.is_empty()) {
                prefix.push('/');
                prefix.push_str(seg);
                self.dirs.insert(prefix.clone());
            }
            return ok();
        }
        if let Some((path, _)) = literal_after(code, "os.rmdir(") {
            let prefix = format!("{path}/");
            let busy = self.files.keys().chain(self.dirs.iter()).any(|p| p.starts_with(&prefix));
            if busy {
                return (String::new(), traceback("OSError", "Directory not empty"));
            }
            self.dirs.remove(&path);
            return ok();
        }
        if let Some((path, _)) = literal_after(code, "os.remove(") {
            return match self.files.remove(&path) {
                Some(_) => ok(),
                None => (String::new(), traceback("OSError", "[Errno 2] ENOENT")),
            };
        }
        if code.starts_with("open(") && code.ends_with(".close()\n") {
            let (path, rest) = literal_after(code, "open(").unwrap();
            let file = self.files.entry(path).or_default();
            if rest.starts_with(",'wb')") {
                file.clear();
            }
            return ok();
        }
        if let Some(rest) = code.trim().strip_prefix("raise ") {
            let (kind, arg) = rest.split_once('(').unwrap_or((rest, ""));
            let msg = py_literal(arg)
                .map(|(m, _)| String::from_utf8(m).unwrap())
                .unwrap_or_default();
            return (String::new(), traceback(kind, &msg));
        }
        let mut stdout = String::new();
        for line in code.lines() {
            if let Some((text, _)) = line.trim().strip_prefix("print(").and_then(py_literal) {
                stdout.push_str(&String::from_utf8(text).unwrap());
                stdout.push_str("\r\n");
            }
        }
        (stdout, String::new())
    }

    fn fails(&self, code: &str) -> bool {
        self.fail_on.as_deref().is_some_and(|f| code.contains(f))
    }

    /// Closes the open file; a failure injected here strikes after the data
    /// is on flash but before the rename.
    fn close(&mut self, code: &str) -> (String, String) {
        let Some((path, data)) = self.open.take() else {
            return (String::new(), traceback("NameError", "name 'f' isn't defined"));
        };
        self.files.insert(path, data);
        if self.fails(code) {
            return (String::new(), traceback("OSError", "[Errno 5] EIO"));
        }
        if let Some((temp, rest)) = literal_after(code, "os.rename(") {
            let (dest, _) = literal_after(rest, ",").unwrap();
            let data = self.files.remove(&temp).unwrap_or_default();
            self.files.insert(dest, data);
        }
        ok()
    }

    fn append(&mut self, data: &[u8]) -> (String, String) {
        match self.open.as_mut() {
            Some((_, buf)) => {
                buf.extend_from_slice(data);
                ok()
            }
            None => (String::new(), traceback("NameError", "name 'f' isn't defined")),
        }
    }

    fn walk(&self) -> String {
        let mut dirs = self.dirs.clone();
        for path in self.files.keys() {
            let mut prefix = String::new();
            let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            for seg in &segs[..segs.len().saturating_sub(1)] {
                prefix.push('/');
                prefix.push_str(seg);
                dirs.insert(prefix.clone());
            }
        }
        let mut lines: Vec<(String, String)> =
            dirs.into_iter().map(|d| (d.clone(), format!("d|{d}|0\r\n"))).collect();
        lines.extend(
            self.files
                .iter()
                .map(|(p, d)| (p.clone(), format!("f|{p}|{}\r\n", d.len()))),
        );
        lines.sort();
        lines.into_iter().map(|(_, l)| l).collect()
    }
}

fn ok() -> (String, String) {
    (String::new(), String::new())
}

fn traceback(kind: &str, msg: &str) -> String {
    format!(
        "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n\
         {kind}: {msg}\r\n"
    )
}

/// Parses a single-quoted Python literal at the start of `s`.
fn py_literal(s: &str) -> Option<(Vec<u8>, &str)> {
    let body = s.strip_prefix('\'')?;
    let mut out = Vec::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\'' => return Some((out, &body[i + 1..])),
            '\\' => match chars.next()?.1 {
                'n' => out.push(b'\n'),
                'r' => out.push(b'\r'),
                't' => out.push(b'\t'),
                'x' => {
                    let hi = chars.next()?.1.to_digit(16)?;
                    let lo = chars.next()?.1.to_digit(16)?;
                    out.push(u8::try_from(hi * 16 + lo).ok()?);
                }
                other => {
                    let mut buf = [0; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            },
            c => {
                let mut buf = [0; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    None
}

/// Finds `marker` and parses the string literal right after it.
fn literal_after<'a>(code: &'a str, marker: &str) -> Option<(String, &'a str)> {
    let start = code.find(marker)? + marker.len();
    let (bytes, rest) = py_literal(&code[start..])?;
    Some((String::from_utf8(bytes).ok()?, rest))
}

/// Test-side view of a [`FakeLink`].
#[derive(Debug, Clone)]
pub(crate) struct FakeHandle {
    device: Arc<Mutex<Device>>,
    sink: Arc<Mutex<Option<Sink>>>,
}

impl FakeHandle {
    /// Runs `f` against the device state.
    pub fn with<T>(&self, f: impl FnOnce(&mut Device) -> T) -> T {
        f(&mut *self.device.lock().unwrap())
    }

    /// Pushes unsolicited output to the host.
    pub fn inject(&self, text: &str) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.deliver(text.as_bytes());
        }
    }

    /// Simulates the device going away.
    pub fn hang_up(&self) {
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.closed();
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.with(|d| d.files.get(path).cloned())
    }
}

/// A [`Link`] backed by a [`Device`].
#[derive(Debug)]
pub(crate) struct FakeLink {
    device: Arc<Mutex<Device>>,
    sink: Arc<Mutex<Option<Sink>>>,
    max_chunk: Option<usize>,
    handshake: Handshake,
}

impl FakeLink {
    pub fn new() -> (Self, FakeHandle) {
        let device = Arc::new(Mutex::new(Device::default()));
        let sink = Arc::new(Mutex::new(None));
        let handle = FakeHandle {
            device: Arc::clone(&device),
            sink: Arc::clone(&sink),
        };
        let link = Self {
            device,
            sink,
            max_chunk: Some(128),
            handshake: Handshake::None,
        };
        (link, handle)
    }

    pub fn with_max_chunk(mut self, max: Option<usize>) -> Self {
        self.max_chunk = max;
        self
    }

    pub fn with_webrepl(mut self, password: Option<&str>) -> Self {
        self.handshake = Handshake::WebRepl {
            password: password.map(str::to_owned),
            prompt_timeout: Duration::from_secs(1),
        };
        self
    }
}

#[async_trait]
impl Link for FakeLink {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn request_access(&mut self) -> Result<LinkInfo> {
        let mut info = LinkInfo::new("fake");
        info.name = Some("fake0".into());
        Ok(info)
    }

    async fn connect(&mut self, sink: Sink) -> Result<()> {
        let greeting = {
            let mut dev = self.device.lock().unwrap();
            if dev.refuse_connect {
                return Err(Error::ConnectFailed("device refused".into()));
            }
            dev.password.is_some().then(|| {
                dev.login = Some(String::new());
                "Password: "
            })
        };
        if let Some(text) = greeting {
            sink.deliver(text.as_bytes());
        }
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let Some(sink) = self.sink.lock().unwrap().clone() else {
            return Err(Error::Closed);
        };
        let output = {
            let mut dev = self.device.lock().unwrap();
            dev.chunks.push(chunk.to_vec());
            dev.feed(&String::from_utf8_lossy(chunk))
        };
        if !output.is_empty() {
            sink.deliver(output.as_bytes());
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.sink.lock().unwrap().take();
        Ok(())
    }

    fn max_chunk(&self) -> Option<usize> {
        self.max_chunk
    }

    fn pacing(&self) -> Duration {
        Duration::ZERO
    }

    fn handshake(&self) -> Handshake {
        self.handshake.clone()
    }
}
