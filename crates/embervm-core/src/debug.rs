//! Remote debugger attachment over TCP.
//!
//! The session is optional tooling layered on a loaded module: bind and
//! handshake failures degrade gracefully and never move the VM handle's
//! lifecycle. Protocol: the client opens a connection and sends one line of
//! magic (`EMBERVM-DEBUG 1`); the server answers `OK <module banner>` and
//! considers the debugger attached.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{VmError, VmResult};

/// Magic line a remote debugger must send to attach.
pub const DEBUG_PROTOCOL_MAGIC: &str = "EMBERVM-DEBUG 1";

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Debug session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    /// No session
    Stopped,
    /// Listener is being set up
    Starting,
    /// Listening, no debugger attached yet
    Listening,
    /// A remote debugger completed the handshake
    Attached,
}

struct DebugShared {
    state: Mutex<DebugState>,
    changed: Condvar,
    shutdown: AtomicBool,
    /// Reason of the most recent failed handshake, if any
    failure: Mutex<Option<String>>,
    /// Attached client, kept open for the session's lifetime
    client: Mutex<Option<TcpStream>>,
}

/// One optional remote-debugger attachment channel.
pub(crate) struct DebugSession {
    shared: Arc<DebugShared>,
    acceptor: Option<JoinHandle<()>>,
    port: Option<u16>,
}

impl DebugSession {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(DebugShared {
                state: Mutex::new(DebugState::Stopped),
                changed: Condvar::new(),
                shutdown: AtomicBool::new(false),
                failure: Mutex::new(None),
                client: Mutex::new(None),
            }),
            acceptor: None,
            port: None,
        }
    }

    pub(crate) fn state(&self) -> DebugState {
        *self.shared.state.lock()
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.state() == DebugState::Attached
    }

    /// Actual listening port (useful when started with port 0).
    pub(crate) fn port(&self) -> Option<u16> {
        self.port
    }

    /// Bind the listener and start the acceptor thread.
    ///
    /// With `wait_for_attach`, blocks the caller until a debugger completes
    /// the handshake or a handshake fails. Failures leave the session
    /// stopped and are non-fatal to the VM lifecycle.
    pub(crate) fn start(&mut self, port: u16, wait_for_attach: bool, banner: String) -> VmResult<()> {
        if self.state() != DebugState::Stopped {
            return Err(VmError::DebugBindFailed {
                port,
                reason: "a debug session is already active".to_string(),
            });
        }
        *self.shared.state.lock() = DebugState::Starting;

        let listener = match TcpListener::bind(("127.0.0.1", port)) {
            Ok(l) => l,
            Err(e) => {
                *self.shared.state.lock() = DebugState::Stopped;
                return Err(VmError::DebugBindFailed {
                    port,
                    reason: e.to_string(),
                });
            }
        };
        if let Err(e) = listener.set_nonblocking(true) {
            *self.shared.state.lock() = DebugState::Stopped;
            return Err(VmError::DebugBindFailed {
                port,
                reason: e.to_string(),
            });
        }
        self.port = listener.local_addr().ok().map(|a| a.port());

        self.shared.shutdown.store(false, Ordering::Release);
        *self.shared.failure.lock() = None;

        let shared = self.shared.clone();
        let acceptor = thread::Builder::new()
            .name("embervm-debug".to_string())
            .spawn(move || accept_loop(listener, banner, shared))
            .map_err(|e| {
                *self.shared.state.lock() = DebugState::Stopped;
                VmError::DebugBindFailed {
                    port,
                    reason: format!("failed to spawn acceptor: {}", e),
                }
            })?;
        self.acceptor = Some(acceptor);

        {
            let mut state = self.shared.state.lock();
            if *state == DebugState::Starting {
                *state = DebugState::Listening;
                self.shared.changed.notify_all();
            }
        }

        if wait_for_attach {
            let mut state = self.shared.state.lock();
            loop {
                if *state == DebugState::Attached {
                    return Ok(());
                }
                let failed = self.shared.failure.lock().take();
                if let Some(reason) = failed {
                    drop(state);
                    self.stop();
                    return Err(VmError::DebugHandshakeFailed(reason));
                }
                if self.shared.shutdown.load(Ordering::Acquire) {
                    return Err(VmError::DebugHandshakeFailed(
                        "session stopped before a debugger attached".to_string(),
                    ));
                }
                self.shared.changed.wait(&mut state);
            }
        }
        Ok(())
    }

    /// Tear the session down. Idempotent; never fails.
    pub(crate) fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.changed.notify_all();
        if let Some(handle) = self.acceptor.take() {
            if handle.join().is_err() {
                eprintln!("embervm: debug acceptor thread panicked during stop");
            }
        }
        *self.shared.client.lock() = None;
        *self.shared.state.lock() = DebugState::Stopped;
        *self.shared.failure.lock() = None;
        self.port = None;
        self.shared.changed.notify_all();
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, banner: String, shared: Arc<DebugShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if *shared.state.lock() == DebugState::Attached {
            // Hold the session open; nothing further to accept.
            thread::sleep(ACCEPT_POLL);
            continue;
        }
        match listener.accept() {
            Ok((stream, _peer)) => handshake(stream, &banner, &shared),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                *shared.failure.lock() = Some(format!("accept failed: {}", e));
                shared.changed.notify_all();
                return;
            }
        }
    }
}

fn handshake(stream: TcpStream, banner: &str, shared: &Arc<DebugShared>) {
    let fail = |reason: String| {
        *shared.failure.lock() = Some(reason);
        shared.changed.notify_all();
    };

    if stream.set_nonblocking(false).is_err()
        || stream.set_read_timeout(Some(HANDSHAKE_READ_TIMEOUT)).is_err()
    {
        fail("could not configure debug socket".to_string());
        return;
    }

    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            fail(format!("socket clone failed: {}", e));
            return;
        }
    });
    let mut line = String::new();
    if let Err(e) = reader.read_line(&mut line) {
        fail(format!("handshake read failed: {}", e));
        return;
    }

    let mut stream = stream;
    if line.trim() != DEBUG_PROTOCOL_MAGIC {
        let _ = stream.write_all(b"ERR protocol mismatch\n");
        fail(format!("unexpected hello: {:?}", line.trim()));
        return;
    }
    if let Err(e) = stream.write_all(format!("OK {}\n", banner).as_bytes()) {
        fail(format!("handshake write failed: {}", e));
        return;
    }

    *shared.client.lock() = Some(stream);
    *shared.state.lock() = DebugState::Attached;
    shared.changed.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn attach_client(port: u16) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(format!("{}\n", DEBUG_PROTOCOL_MAGIC).as_bytes())
            .unwrap();
        stream
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 2s");
    }

    #[test]
    fn test_attach_handshake() {
        let mut session = DebugSession::new();
        session.start(0, false, "game.evm".to_string()).unwrap();
        assert_eq!(session.state(), DebugState::Listening);

        let mut client = attach_client(session.port().unwrap());
        wait_for(|| session.is_attached());

        let mut reply = String::new();
        let mut reader = BufReader::new(&mut client);
        reader.read_line(&mut reply).unwrap();
        assert_eq!(reply.trim(), "OK game.evm");

        session.stop();
        assert_eq!(session.state(), DebugState::Stopped);
    }

    #[test]
    fn test_bind_conflict_reported() {
        // occupy a port, then ask the session for the same one
        let taken = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut session = DebugSession::new();
        match session.start(port, false, "m".to_string()) {
            Err(VmError::DebugBindFailed { port: p, .. }) => assert_eq!(p, port),
            other => panic!("expected DebugBindFailed, got {:?}", other),
        }
        assert_eq!(session.state(), DebugState::Stopped);
    }

    #[test]
    fn test_wait_for_attach_blocks_until_handshake() {
        let mut session = DebugSession::new();
        // learn the port without waiting, stop, restart on it with wait
        session.start(0, false, "m".to_string()).unwrap();
        let port = session.port().unwrap();
        session.stop();

        let client = thread::spawn(move || {
            // retry until the waiting listener is up
            for _ in 0..200 {
                if let Ok(mut s) = TcpStream::connect(("127.0.0.1", port)) {
                    s.write_all(format!("{}\n", DEBUG_PROTOCOL_MAGIC).as_bytes())
                        .unwrap();
                    let mut reply = String::new();
                    BufReader::new(&s).read_line(&mut reply).unwrap();
                    return reply;
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("could not connect to debug session");
        });

        session.start(port, true, "m".to_string()).unwrap();
        assert!(session.is_attached());
        assert!(client.join().unwrap().starts_with("OK"));
        session.stop();
    }

    #[test]
    fn test_bad_magic_fails_waiting_start() {
        let mut session = DebugSession::new();
        session.start(0, false, "m".to_string()).unwrap();
        let port = session.port().unwrap();
        session.stop();

        let client = thread::spawn(move || {
            for _ in 0..200 {
                if let Ok(mut s) = TcpStream::connect(("127.0.0.1", port)) {
                    s.write_all(b"GDB 12\n").unwrap();
                    let mut buf = Vec::new();
                    let _ = s.read_to_end(&mut buf);
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
        });

        match session.start(port, true, "m".to_string()) {
            Err(VmError::DebugHandshakeFailed(reason)) => {
                assert!(reason.contains("GDB"), "reason: {}", reason)
            }
            other => panic!("expected DebugHandshakeFailed, got {:?}", other),
        }
        client.join().unwrap();
        assert_eq!(session.state(), DebugState::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut session = DebugSession::new();
        session.stop();
        session.start(0, false, "m".to_string()).unwrap();
        session.stop();
        session.stop();
        assert_eq!(session.state(), DebugState::Stopped);
    }

    #[test]
    fn test_second_start_while_active_fails() {
        let mut session = DebugSession::new();
        session.start(0, false, "m".to_string()).unwrap();
        let port = session.port().unwrap();
        assert!(matches!(
            session.start(port, false, "m".to_string()),
            Err(VmError::DebugBindFailed { .. })
        ));
        session.stop();
    }
}
