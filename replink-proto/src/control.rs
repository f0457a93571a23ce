//! Control bytes sent to the device and markers recognised in its output.

/// Ctrl-A: enter raw REPL.
pub const ENTER_RAW: &str = "\x01";
/// Ctrl-B: leave raw REPL.
pub const EXIT_RAW: &str = "\x02";
/// Ctrl-C: interrupt the running program.
pub const INTERRUPT: &str = "\x03";
/// Ctrl-D: execute the buffered code (raw mode) or soft reboot (friendly mode).
pub const EXECUTE: &str = "\x04";

/// Sent before probing: carriage return plus a double interrupt.
pub const INTERRUPT_TWICE: &str = "\r\x03\x03";
/// Carriage return plus Ctrl-A.
pub const ENTER_RAW_SEQ: &str = "\r\x01";
/// Soft reboot while in raw mode; the device re-enters raw mode by itself.
pub const SOFT_REBOOT_RAW: &str = "\x04\x03";
/// Soft reboot from the friendly REPL.
pub const SOFT_REBOOT: &str = "\r\x03\x03\x04";

/// Banner printed when raw mode is entered.
pub const RAW_BANNER: &str = "raw REPL; CTRL-B to exit\r\n";
/// Raw mode idle prompt.
pub const RAW_PROMPT: &str = ">";
/// Status acknowledging a received code block.
pub const STATUS_OK: &str = "OK";
/// Terminates stdout and then stderr of one execution.
pub const FRAME_END: &str = "\x04";
/// The raw prompt followed by the line break printed on leaving raw mode.
pub const EXIT_CONFIRM: &str = ">\r\n";

/// Standard friendly-REPL prompt.
pub const PROMPT: &str = ">>> ";
/// Prompt printed by `aiorepl` and similar asyncio front-ends.
pub const ALT_PROMPT: &str = "--> ";
/// Idle prompts tried when no prompt has been detected for a device yet.
pub const IDLE_PROMPTS: &[&str] = &[PROMPT, ALT_PROMPT];

/// Substring identifying a user-triggered cancellation in stderr.
pub const KEYBOARD_INTERRUPT: &str = "KeyboardInterrupt";

/// Bootstrap statement run right after entering raw mode.
pub const BOOTSTRAP: &str = "import sys,os";

/// WebREPL login prompt.
pub const WEBREPL_PASSWORD: &str = "Password:";
/// WebREPL reply to a correct password.
pub const WEBREPL_CONNECTED: &str = "WebREPL connected";
/// WebREPL reply to a wrong password.
pub const WEBREPL_DENIED: &str = "Access denied";

/// Reboot flavours reachable from the friendly REPL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum RebootMode {
    /// Restart the interpreter only.
    Soft,
    /// Full chip reset via `machine.reset()`.
    #[default]
    Hard,
    /// Jump into the bootloader via `machine.bootloader()`.
    Bootloader,
}

impl RebootMode {
    /// Statement typed into the friendly REPL, if the mode needs one.
    pub const fn statement(self) -> Option<&'static str> {
        match self {
            Self::Soft => None,
            Self::Hard => Some("import machine; machine.reset()\r\n"),
            Self::Bootloader => Some("import machine; machine.bootloader()\r\n"),
        }
    }
}

impl std::fmt::Display for RebootMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Bootloader => "bootloader",
        })
    }
}

impl std::str::FromStr for RebootMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(Self::Soft),
            "hard" => Ok(Self::Hard),
            "bootloader" | "dfu" => Ok(Self::Bootloader),
            _ => Err(format!("unknown reboot mode: {s}")),
        }
    }
}
