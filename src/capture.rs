//! PTY supervisor: transparent session capture with full interactivity.
//!
//! The child runs under a pseudo-terminal so interactive tools behave as on
//! a real terminal. The parent relays bytes both ways, writing child output
//! to the user's stdout FIRST and only then feeding the capture path, so a
//! failing disk never interferes with the session. Terminal attributes and
//! signal handlers are restored on every exit path via drop guards.

#![cfg(unix)]

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::pty::{forkpty, ForkptyResult};
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{self, SetArg, Termios};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};

use crate::core::models::EventSource;
use crate::error::{MbError, Result};
use crate::sanitizer::AnsiStripper;
use crate::storage::NdjsonStorage;

/// Poll timeout in milliseconds.
const POLL_TIMEOUT_MS: i32 = 100;

/// Read buffer size for both directions.
const READ_BUF_SIZE: usize = 16_384;

/// EOT (Ctrl-D), sent to the child when our stdin reaches EOF.
const EOT: u8 = 0x04;

fn raw_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_write_all(fd: RawFd, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        data = &data[n as usize..];
    }
    Ok(())
}

fn get_winsize(fd: RawFd) -> Option<libc::winsize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, std::ptr::addr_of_mut!(ws)) };
    (rc == 0).then_some(ws)
}

fn set_winsize(fd: RawFd, ws: &libc::winsize) {
    unsafe {
        libc::ioctl(fd, libc::TIOCSWINSZ, std::ptr::from_ref(ws));
    }
}

/// Restores the original termios on drop, covering every exit path
/// including panics in the relay loop.
struct TerminalGuard {
    original: Option<Termios>,
}

impl TerminalGuard {
    /// Puts stdin into raw mode when it is a terminal; otherwise a no-op.
    fn raw_mode() -> Self {
        let stdin = std::io::stdin();
        let Ok(original) = termios::tcgetattr(&stdin) else {
            return Self { original: None };
        };
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        if termios::tcsetattr(&stdin, SetArg::TCSAFLUSH, &raw).is_err() {
            return Self { original: None };
        }
        Self {
            original: Some(original),
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSAFLUSH, &original);
        }
    }
}

/// Unregisters the flag handlers on drop.
struct SignalGuard {
    ids: Vec<signal_hook::SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Runs `child_cmd` in a PTY with transparent capture.
///
/// Returns the child's exit code (128 + signo for signal termination) and
/// the created session id. Every event write inside the relay loop is
/// best-effort: persistence failures never disturb the byte relay.
pub fn run_session(storage: &NdjsonStorage, child_cmd: &[String]) -> Result<(i32, String)> {
    if child_cmd.is_empty() {
        return Err(MbError::InvalidInput(
            "No command specified. Usage: mb run -- <command>".to_string(),
        ));
    }

    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
    let meta = storage.create_session(child_cmd, &cwd, Some(EventSource::Pty), true)?;
    let session_id = meta.session_id;

    let _ = storage.write_event(&session_id, "system", "system", "session_start", 0.0);
    eprintln!("[mb] Session {session_id} started");

    let stdin_fd: RawFd = libc::STDIN_FILENO;
    let stdout_fd: RawFd = libc::STDOUT_FILENO;
    let is_tty = unsafe { libc::isatty(stdin_fd) } == 1;

    // Propagate the current window size into the new PTY at fork time.
    let winsize = if is_tty { get_winsize(stdin_fd) } else { None };

    // Argv is prepared before the fork so the child does nothing but exec.
    let program = CString::new(child_cmd[0].as_bytes()).ok();
    let args: Vec<CString> = child_cmd
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .collect();

    // Fork the child under a fresh PTY. The child half execs immediately;
    // only the parent half returns from this block.
    let (child, master): (Pid, OwnedFd) =
        match unsafe { forkpty(winsize.as_ref(), None::<&Termios>) }
            .map_err(std::io::Error::from)?
        {
            ForkptyResult::Parent { child, master } => (child, master),
            ForkptyResult::Child => {
                if let Some(program) = program.as_ref() {
                    let _ = execvp(program, &args);
                }
                // exec failed; never run parent code from the fork.
                unsafe { libc::_exit(127) }
            }
        };

    let sigwinch = Arc::new(AtomicBool::new(false));
    let sigint = Arc::new(AtomicBool::new(false));
    let mut signal_ids = Vec::new();
    if let Ok(id) = signal_hook::flag::register(signal_hook::consts::SIGWINCH, sigwinch.clone()) {
        signal_ids.push(id);
    }
    if let Ok(id) = signal_hook::flag::register(signal_hook::consts::SIGINT, sigint.clone()) {
        signal_ids.push(id);
    }
    let _signal_guard = SignalGuard { ids: signal_ids };
    let _terminal_guard = if is_tty {
        TerminalGuard::raw_mode()
    } else {
        TerminalGuard { original: None }
    };

    let t0 = std::time::Instant::now();
    let mut output_stripper = AnsiStripper::new();
    let mut input_stripper = AnsiStripper::new();

    relay_loop(RelayContext {
        storage,
        session_id: &session_id,
        master_fd: master.as_raw_fd(),
        stdin_fd,
        stdout_fd,
        is_tty,
        child,
        t0,
        sigwinch: &sigwinch,
        sigint: &sigint,
        output_stripper: &mut output_stripper,
        input_stripper: &mut input_stripper,
    });

    // Flush any state still buffered in the strippers.
    let ts = t0.elapsed().as_secs_f64();
    let remaining_out = output_stripper.flush();
    if !remaining_out.is_empty() {
        let _ = storage.write_event(&session_id, "stdout", "terminal", &remaining_out, ts);
    }
    let remaining_in = input_stripper.flush();
    if !remaining_in.is_empty() {
        let _ = storage.write_event(&session_id, "stdin", "user", &remaining_in, ts);
    }

    let exit_code = match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        _ => 1,
    };

    drop(master);

    let ts_end = t0.elapsed().as_secs_f64();
    let _ = storage.write_event(&session_id, "system", "system", "session_end", ts_end);
    let _ = storage.finalize_session(&session_id, Some(exit_code));

    eprintln!("[mb] Session {session_id} ended (exit code: {exit_code})");
    Ok((exit_code, session_id))
}

struct RelayContext<'a> {
    storage: &'a NdjsonStorage,
    session_id: &'a str,
    master_fd: RawFd,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    is_tty: bool,
    child: Pid,
    t0: std::time::Instant,
    sigwinch: &'a AtomicBool,
    sigint: &'a AtomicBool,
    output_stripper: &'a mut AnsiStripper,
    input_stripper: &'a mut AnsiStripper,
}

/// The poll loop. Exits when the master side reports EOF/EIO (child gone).
fn relay_loop(mut ctx: RelayContext<'_>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut stdin_open = true;

    loop {
        // Mirror window-size changes into the child's PTY.
        if ctx.sigwinch.swap(false, Ordering::Relaxed) && ctx.is_tty {
            if let Some(ws) = get_winsize(ctx.stdin_fd) {
                set_winsize(ctx.master_fd, &ws);
            }
        }
        // Forward interrupts to the child instead of dying ourselves.
        if ctx.sigint.swap(false, Ordering::Relaxed) {
            let _ = kill(ctx.child, Signal::SIGINT);
        }

        let mut fds = [
            libc::pollfd {
                fd: ctx.master_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: if stdin_open { ctx.stdin_fd } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break;
        }

        let master_ready = fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0;
        let stdin_ready = stdin_open && fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0;

        if master_ready {
            match raw_read(ctx.master_fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let data = &buf[..n];
                    // Relay to the user first, capture second.
                    let _ = raw_write_all(ctx.stdout_fd, data);

                    let ts = ctx.t0.elapsed().as_secs_f64();
                    let sanitized = ctx.output_stripper.process(data);
                    if !sanitized.is_empty() {
                        let _ = ctx.storage.write_event(
                            ctx.session_id,
                            "stdout",
                            "terminal",
                            &sanitized,
                            ts,
                        );
                    }
                }
                Err(_) => {
                    // EIO from the master means the child exited; any other
                    // read failure also ends the relay.
                    break;
                }
            }
        }

        if stdin_ready {
            match raw_read(ctx.stdin_fd, &mut buf) {
                Ok(0) => {
                    // EOF from the user: hand the child an EOT but keep
                    // draining its output until it closes the PTY.
                    stdin_open = false;
                    let _ = raw_write_all(ctx.master_fd, &[EOT]);
                }
                Ok(n) => {
                    let data = &buf[..n];
                    let _ = raw_write_all(ctx.master_fd, data);

                    let ts = ctx.t0.elapsed().as_secs_f64();
                    let sanitized = ctx.input_stripper.process(data);
                    if !sanitized.is_empty() {
                        let _ = ctx.storage.write_event(
                            ctx.session_id,
                            "stdin",
                            "user",
                            &sanitized,
                            ts,
                        );
                    }
                }
                Err(err) => {
                    if err.raw_os_error() == Some(libc::EIO) {
                        stdin_open = false;
                    } else if err.raw_os_error() != Some(libc::EINTR) {
                        stdin_open = false;
                    }
                }
            }
        }
    }
}
