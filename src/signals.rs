//! Log-stream signatures the harness treats as protocol.
//!
//! The guest kernel writes one event per line on its serial console. A handful
//! of line shapes carry meaning for the harness itself rather than for any one
//! scenario: the two fault markers that end a run, the scheduler trace used for
//! idle detection, and the userland entry-point trace used to confirm that a
//! binary started. They live here as named patterns so scenario code never
//! spells them out by hand.
//!
//! ## Line shapes
//!
//! ```text
//!  9844t 0/TID10[kernel::threads] - L270: reschedule() - No active threads, idling
//!  9849d 0/TID1[kernel::threads] - Idle task switch to 0xffff800000000480(2 IRQ Worker)
//!  1203k 0/TID4[kernel::unwind] - ...                       (kernel fault)
//!  1203d 0/TID7[syscalls] - USER> PANIC: ...                 (user fault)
//!  1203d 0/TID7[syscalls] - USER> Calling entry 0x1234 for b"/sysroot/bin/shell"
//! ```
//!
//! Lines usually arrive wrapped in SGR colour escapes; none of the patterns are
//! anchored, so matching works on the raw line.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Kernel-mode fault marker (unwinder output).
pub const KERNEL_FAULT_PATTERN: &str = r"\d+k \d+/TID\d+\[kernel::unwind\] - ";
/// User-mode fault marker (panic forwarded through the syscall log).
pub const USER_FAULT_PATTERN: &str = r"\d+d \d+/TID\d+\[syscalls\] - USER> PANIC: ";
/// Scheduler trace line; group 1 is the scheduler message.
pub const THREAD_SWITCH_PATTERN: &str = r"\d+[td] \d+/TID\d+\[kernel::threads\] - (.*)";
/// Userland entry point invoked; group 1 is the binary path.
pub const ENTRY_INVOKED_PATTERN: &str =
    r#"\[syscalls\] - USER> Calling entry 0x[0-9a-f]+ for b"(.*)""#;

static KERNEL_FAULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(KERNEL_FAULT_PATTERN).expect("kernel fault pattern"));
static USER_FAULT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(USER_FAULT_PATTERN).expect("user fault pattern"));
static THREAD_SWITCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(THREAD_SWITCH_PATTERN).expect("thread switch pattern"));
static ENTRY_INVOKED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ENTRY_INVOKED_PATTERN).expect("entry invoked pattern"));

/// Which fault marker was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Kernel,
    User,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Kernel => f.write_str("Kernel panic"),
            FaultKind::User => f.write_str("User panic"),
        }
    }
}

/// Scan a line for either fault marker. Kernel faults win if both appear.
pub fn detect_fault(line: &str) -> Option<FaultKind> {
    if KERNEL_FAULT_RE.is_match(line) {
        return Some(FaultKind::Kernel);
    }
    if USER_FAULT_RE.is_match(line) {
        return Some(FaultKind::User);
    }
    None
}

/// Return the scheduler message if `line` is a scheduler trace line.
pub fn thread_switch_message(line: &str) -> Option<&str> {
    THREAD_SWITCH_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Compiled entry-invoked pattern, shared by `wait_startapp`.
pub fn entry_invoked() -> &'static Regex {
    &ENTRY_INVOKED_RE
}

/// Remove terminal escape sequences before a line is shown to a human.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("ansi pattern")
    });
    ANSI_RE.replace_all(input, "").to_string()
}
