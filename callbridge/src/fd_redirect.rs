//! File descriptor redirection for worker stdio isolation.
//!
//! The worker speaks the protocol over its own stdin/stdout. Handlers are
//! ordinary code and may `println!`, or spawn children that inherit fd 1 and
//! write straight into it. Either would corrupt the response stream.
//!
//! We redirect early in startup: the protocol pipes move to high-numbered
//! fds (99/100), fd 0 is pointed at /dev/null, and fd 1 becomes a pipe whose
//! contents are re-emitted as tracing events under the `callbridge::user`
//! target. fd 2 is left alone since tracing already writes there.
//!
//! ## Safety contracts
//!
//! All `unsafe` blocks in this module rely on these guarantees:
//! 1. Called before any handler runs and before the runtime starts reading fds 0/1
//! 2. Standard fds (0, 1) are guaranteed open by the OS at process startup
//! 3. High-numbered fds (99, 100) won't conflict with application/library usage
//! 4. Ownership transfer to the capture thread via `from_raw_fd` + `forget` prevents double-close

use std::io::{self, BufRead, BufReader};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::unistd::{dup, dup2, pipe};

/// Target used for output captured from handlers' stdout.
pub const USER_OUTPUT_TARGET: &str = "callbridge::user";

const PROTOCOL_STDIN_FD: i32 = 99;
const PROTOCOL_STDOUT_FD: i32 = 100;

pub struct ProtocolFds {
    pub stdin_fd: OwnedFd,
    pub stdout_fd: OwnedFd,
}

/// Move the protocol channel off fds 0/1 and capture anything else written
/// to stdout.
///
/// Must run before any handler code. Children spawned afterwards inherit the
/// capture pipe, not the protocol channel.
pub fn isolate_stdio() -> io::Result<ProtocolFds> {
    tracing::debug!("Preserving protocol channel on high fds");

    let protocol_stdin = unsafe { dup(BorrowedFd::borrow_raw(0)) }
        .map_err(|e| io::Error::other(format!("dup(0) failed: {e}")))?;
    let protocol_stdout = unsafe { dup(BorrowedFd::borrow_raw(1)) }
        .map_err(|e| io::Error::other(format!("dup(1) failed: {e}")))?;

    let mut target_stdin = unsafe { OwnedFd::from_raw_fd(PROTOCOL_STDIN_FD) };
    dup2(&protocol_stdin, &mut target_stdin)
        .map_err(|e| io::Error::other(format!("dup2 stdin failed: {e}")))?;
    std::mem::forget(target_stdin);

    let mut target_stdout = unsafe { OwnedFd::from_raw_fd(PROTOCOL_STDOUT_FD) };
    dup2(&protocol_stdout, &mut target_stdout)
        .map_err(|e| io::Error::other(format!("dup2 stdout failed: {e}")))?;
    std::mem::forget(target_stdout);

    drop(protocol_stdin);
    drop(protocol_stdout);

    tracing::trace!(
        stdin_fd = PROTOCOL_STDIN_FD,
        stdout_fd = PROTOCOL_STDOUT_FD,
        "Moved protocol channel to high fds"
    );

    // Handlers reading stdin would otherwise steal request bytes.
    let dev_null = std::fs::File::open("/dev/null")?;
    let mut target_fd0 = unsafe { OwnedFd::from_raw_fd(0) };
    dup2(&dev_null, &mut target_fd0)
        .map_err(|e| io::Error::other(format!("dup2(stdin) failed: {e}")))?;
    std::mem::forget(target_fd0);
    drop(dev_null);

    let (capture_read, capture_write) =
        pipe().map_err(|e| io::Error::other(format!("pipe failed: {e}")))?;

    let mut target_fd1 = unsafe { OwnedFd::from_raw_fd(1) };
    dup2(&capture_write, &mut target_fd1)
        .map_err(|e| io::Error::other(format!("dup2(stdout) failed: {e}")))?;
    std::mem::forget(target_fd1);
    drop(capture_write);

    let capture_read_raw = capture_read.as_raw_fd();
    std::thread::Builder::new()
        .name("stdout-capture".into())
        .spawn(move || {
            // Safety: ownership of capture_read moved into this thread.
            let file = unsafe { std::fs::File::from_raw_fd(capture_read_raw) };
            forward_lines(BufReader::new(file));
        })?;
    std::mem::forget(capture_read);

    tracing::debug!("Stdio isolation complete");

    Ok(ProtocolFds {
        stdin_fd: unsafe { OwnedFd::from_raw_fd(PROTOCOL_STDIN_FD) },
        stdout_fd: unsafe { OwnedFd::from_raw_fd(PROTOCOL_STDOUT_FD) },
    })
}

/// Re-emit each captured line as a tracing event. Runs until the write end
/// closes.
fn forward_lines<R: BufRead>(mut reader: R) -> usize {
    let mut line = Vec::new();
    let mut forwarded = 0;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\n', '\r']);
                tracing::info!(target: USER_OUTPUT_TARGET, source = "stdout", "{text}");
                forwarded += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_each_line_including_unterminated_tail() {
        let input = b"first\nsecond\r\nno newline".as_slice();
        assert_eq!(forward_lines(input), 3);
    }

    #[test]
    fn empty_input_forwards_nothing() {
        assert_eq!(forward_lines(b"".as_slice()), 0);
    }

    #[test]
    fn invalid_utf8_is_forwarded_lossily() {
        assert_eq!(forward_lines(b"\xff\xfe\n".as_slice()), 1);
    }
}
