use std::{
    io::{self, Read},
    thread,
    time::{Duration, Instant},
};

use ssh2::Session;

use crate::remote::{error::TransportError, transport::ExecOutput};

const IDLE_POLL: Duration = Duration::from_millis(10);

/// Run `line` on a fresh channel of `session` and collect everything it printed.
///
/// Fails with `TimedOut` when the command prints nothing for `timeout`.
pub fn execute(session: &Session, line: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
    let mut channel = session.channel_session()?;
    channel.exec(line)?;

    let (stdout, stderr) = {
        let _nonblocking = NonBlocking::enter(session);
        drain(&mut channel.stream(0), &mut channel.stderr(), || channel.eof(), timeout)?
    };

    channel.wait_close()?;
    let exit_code = channel.exit_status()?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

struct NonBlocking<'a>(&'a Session);

impl<'a> NonBlocking<'a> {
    fn enter(session: &'a Session) -> Self {
        session.set_blocking(false);
        Self(session)
    }
}

impl Drop for NonBlocking<'_> {
    fn drop(&mut self) {
        self.0.set_blocking(true);
    }
}

/// Read both streams in turns until `eof` reports the remote side is done.
/// Neither stream can fill its window while the other one is being read.
fn drain(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    eof: impl Fn() -> bool,
    timeout: Duration,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    let mut idle_since = Instant::now();

    loop {
        let read_out = read_available(stdout, &mut buf, &mut out)?;
        let read_err = read_available(stderr, &mut buf, &mut err)?;

        if read_out || read_err {
            idle_since = Instant::now();
            continue;
        }
        if eof() {
            return Ok((out, err));
        }
        if idle_since.elapsed() >= timeout {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no output for {} s", timeout.as_secs_f32()),
            ));
        }

        thread::sleep(IDLE_POLL);
    }
}

/// Whatever `stream` has buffered right now. `true` if anything was read.
fn read_available(stream: &mut impl Read, buf: &mut [u8], into: &mut Vec<u8>) -> io::Result<bool> {
    let mut progress = false;

    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(progress),
            Ok(n) => {
                into.extend_from_slice(&buf[..n]);
                progress = true;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}
