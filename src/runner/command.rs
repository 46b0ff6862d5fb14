//! Subprocess execution under a PTY.
//!
//! Commands run through `sh -c` on a pseudo-terminal so their output is
//! a faithful terminal stream (colors, progress redraws). Output is
//! captured in full; callers may additionally receive chunks live as
//! they arrive. Cancellation sends a termination to the child and
//! escalates to a second kill after roughly a second.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use super::CancellationToken;

/// How long a child gets to exit after the first termination attempt.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// How often the child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Callback receiving live output chunks.
pub type OutputForwarder = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub terminal_output: String,
    /// Whether the command was terminated by cancellation.
    pub canceled: bool,
}

/// Run `command` to completion (or cancellation) under a PTY.
pub fn run(
    command: &str,
    cwd: &Utf8Path,
    forward: Option<OutputForwarder>,
    cancel: &CancellationToken,
) -> std::io::Result<CommandOutcome> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 40,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(std::io::Error::other)?;

    let mut builder = CommandBuilder::new("sh");
    builder.arg("-c");
    builder.arg(command);
    builder.cwd(cwd.as_std_path());

    let mut child = pair
        .slave
        .spawn_command(builder)
        .map_err(std::io::Error::other)?;
    // Dropping our slave handle lets the reader see EOF once the child
    // exits.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(std::io::Error::other)?;

    let collector = std::thread::spawn(move || {
        let mut buffer = [0u8; 8192];
        let mut collected = Vec::new();

        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buffer[..n]);
                    if let Some(forward) = &forward {
                        forward(&String::from_utf8_lossy(&buffer[..n]));
                    }
                }
            }
        }

        collected
    });

    let mut killer = child.clone_killer();
    let mut kill_sent_at: Option<Instant> = None;
    let mut canceled = false;

    let exit_code = loop {
        if let Some(status) = child.try_wait()? {
            break status.exit_code() as i32;
        }

        if cancel.is_canceled() {
            match kill_sent_at {
                None => {
                    canceled = true;
                    let _ = killer.kill();
                    kill_sent_at = Some(Instant::now());
                }
                Some(sent) if sent.elapsed() >= KILL_GRACE => {
                    // Escalate once, then stop waiting on the child.
                    let _ = killer.kill();
                    break 130;
                }
                Some(_) => {}
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    };

    // Closing the master unblocks the reader if the child left the PTY
    // open (e.g. a still-running grandchild).
    drop(pair.master);
    let collected = collector.join().unwrap_or_default();

    Ok(CommandOutcome {
        exit_code,
        terminal_output: String::from_utf8_lossy(&collected).into_owned(),
        canceled,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;

    fn cwd() -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(std::env::temp_dir()).unwrap()
    }

    #[test]
    fn captures_output_and_exit_code() {
        let outcome = run(
            "echo hello-from-pty",
            &cwd(),
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.canceled);
        assert!(outcome.terminal_output.contains("hello-from-pty"));
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let outcome = run("exit 3", &cwd(), None, &CancellationToken::new()).unwrap();
        assert_eq!(outcome.exit_code, 3);
    }

    #[test]
    fn output_is_a_terminal_stream() {
        // Under a PTY, `test -t 1` sees a terminal on stdout.
        let outcome = run(
            "test -t 1 && echo is-a-tty",
            &cwd(),
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.terminal_output.contains("is-a-tty"));
    }

    #[test]
    fn forwarder_receives_live_chunks() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&seen);

        let outcome = run(
            "printf first; printf second",
            &cwd(),
            Some(Arc::new(move |chunk: &str| {
                sink.lock().unwrap().push_str(chunk);
            })),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(outcome.exit_code, 0);
        let forwarded = seen.lock().unwrap();
        assert!(forwarded.contains("first"));
        assert!(forwarded.contains("second"));
    }

    #[test]
    fn cancellation_kills_a_running_command() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = run("sleep 30", &cwd(), None, &cancel).unwrap();

        assert!(outcome.canceled);
        assert_ne!(outcome.exit_code, 0);
        // Well under the 30s the command asked for.
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
