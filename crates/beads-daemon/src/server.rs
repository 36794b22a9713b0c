//! Unix-socket server: accept loop, per-connection threads, stale socket
//! cleanup, and cooperative shutdown.

use std::io::{BufReader, BufWriter};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use beads_core::cancel::CancelToken;

use crate::Daemon;
use crate::protocol::{Request, Response, read_frame, write_frame};

/// Serves requests on the workspace socket until `shutdown` is requested.
///
/// The socket path doubles as the daemon's mutual-exclusion token: a
/// stale socket left by a dead process is detected (connect fails) and
/// removed; a live one refuses the second daemon.
pub fn serve(daemon: Arc<Daemon>) -> std::io::Result<()> {
    let socket_path = daemon.socket_path();
    remove_stale_socket(&socket_path)?;

    let listener = UnixListener::bind(&socket_path)?;
    // Poll the shutdown flag between accepts.
    listener.set_nonblocking(true)?;
    info!(path = %socket_path.display(), "listening");

    let mut workers: Vec<std::thread::JoinHandle<()>> = Vec::new();
    loop {
        if daemon.is_shutting_down() {
            break;
        }
        match listener.accept() {
            Ok((stream, _addr)) => {
                // The listener polls; connections block normally.
                let _ = stream.set_nonblocking(false);
                if !daemon.state.try_add_connection() {
                    warn!("connection limit reached, refusing client");
                    refuse_connection(stream, daemon.state.max_connections);
                    continue;
                }
                let daemon = Arc::clone(&daemon);
                workers.push(std::thread::spawn(move || {
                    handle_connection(&daemon, stream);
                    daemon.state.remove_connection();
                }));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                error!(error = %e, "accept failed");
            }
        }
        workers.retain(|h| !h.is_finished());
    }

    // Drain in-flight connections, then remove the socket.
    info!("shutting down, draining connections");
    for handle in workers {
        let _ = handle.join();
    }
    let _ = std::fs::remove_file(&socket_path);
    info!("shutdown complete");
    Ok(())
}

/// Removes a socket file left behind by a dead daemon. Errors if a live
/// daemon still answers on it.
fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match UnixStream::connect(path) {
        Ok(_) => Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("another daemon is already serving {}", path.display()),
        )),
        Err(_) => {
            warn!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path)
        }
    }
}

/// Tells an over-limit client why it is being turned away.
fn refuse_connection(stream: UnixStream, max_connections: usize) {
    let mut writer = BufWriter::new(stream);
    let resp = Response::err(
        "storage",
        format!("connection limit reached ({max_connections}); retry shortly"),
    );
    let _ = write_frame(&mut writer, &resp);
}

/// Services one connection: a loop of request frames, one response per
/// request. Returns on EOF, protocol error, or shutdown.
fn handle_connection(daemon: &Daemon, stream: UnixStream) {
    let peer = BufReader::new(match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to clone connection stream");
            return;
        }
    });
    let mut reader = peer;
    let mut writer = BufWriter::new(stream);

    loop {
        if daemon.is_shutting_down() {
            debug!("connection closing for shutdown");
            return;
        }
        let request: Request = match read_frame(&mut reader) {
            Ok(Some(req)) => req,
            Ok(None) => return, // clean EOF
            Err(e) => {
                debug!(error = %e, "connection read failed");
                let _ = write_frame(
                    &mut writer,
                    &Response::err("validation", format!("malformed request: {e}")),
                );
                return;
            }
        };

        // One token per request; a dropped connection stops mattering at
        // the next poll point.
        let cancel = CancelToken::new();
        let response = daemon.handle_request(&request, &cancel);
        if let Err(e) = write_frame(&mut writer, &response) {
            debug!(error = %e, "connection write failed");
            return;
        }
    }
}
