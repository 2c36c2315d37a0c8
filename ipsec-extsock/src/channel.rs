//! C7 — Control Channel.
//!
//! A Unix domain socket accepting a single client connection at a time
//! (spec §4.7, §6.1). Framing is raw: each `recv()` of up to 4 KiB is
//! treated as one command line, with no length prefix — matching the
//! original socket adapter this plugin's protocol was modeled on.

use std::os::unix::io::FromRawFd;
use std::sync::Arc;

use camino::Utf8PathBuf;
use devolutions_gateway_task::{ShutdownSignal, Task};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::error::{ExtsockError, Result};
use crate::events::EventSink;

/// Default path from spec §6.1. Overridable via [`PluginSettings`](crate::PluginSettings).
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/strongswan_extsock.sock";

const RECV_BUF_SIZE: usize = 4096;
const LISTEN_BACKLOG: i32 = 5;

/// Dispatches one received command line to the rest of the plugin.
/// Implemented by the command router (C8).
pub trait CommandHandler: Send + Sync {
    fn handle(&self, line: &str) -> Result<()>;
}

/// A clonable handle event producers (C5) use to push JSON payloads to
/// whichever client is currently connected. Publishing while no client
/// is connected silently drops the event — there is nobody to receive it.
#[derive(Clone)]
pub struct ControlChannelSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl EventSink for ControlChannelSink {
    fn publish(&self, payload: Value) {
        // An unbounded channel never blocks; a send error only happens
        // once the channel task itself has shut down, which is fine to
        // ignore here.
        let _ = self.tx.send(payload);
    }
}

/// Bind a Unix domain socket with an explicit listen backlog. `std`'s
/// `UnixListener::bind` does not expose backlog control, so the socket is
/// created through raw libc calls instead (spec §6.1: backlog of 5).
fn bind_with_backlog(path: &Utf8PathBuf) -> std::io::Result<std::os::unix::net::UnixListener> {
    let _ = std::fs::remove_file(path);

    // SAFETY: standard AF_UNIX/SOCK_STREAM socket creation and bind/listen
    // calls, checked for -1 return at each step.
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let path_bytes = path.as_str().as_bytes();
        if path_bytes.len() >= addr.sun_path.len() {
            libc::close(fd);
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "socket path too long"));
        }
        for (dst, src) in addr.sun_path.iter_mut().zip(path_bytes.iter()) {
            *dst = *src as libc::c_char;
        }

        let addr_len = std::mem::size_of::<libc::sa_family_t>() + path_bytes.len() + 1;
        if libc::bind(fd, &addr as *const _ as *const libc::sockaddr, addr_len as libc::socklen_t) < 0 {
            let error = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(error);
        }
        if libc::listen(fd, LISTEN_BACKLOG) < 0 {
            let error = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(error);
        }

        let listener = std::os::unix::net::UnixListener::from_raw_fd(fd);
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

async fn recv_one(reader: &mut OwnedReadHalf) -> std::io::Result<Option<String>> {
    let mut buf = vec![0u8; RECV_BUF_SIZE];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(String::from_utf8_lossy(&buf).trim_end().to_owned()))
}

/// The control channel worker. One instance per plugin lifetime.
pub struct ControlChannel {
    socket_path: Utf8PathBuf,
    handler: Arc<dyn CommandHandler>,
    event_rx: mpsc::UnboundedReceiver<Value>,
    /// Tracked only so the socket file is removed again on clean shutdown.
    connected: Arc<Mutex<bool>>,
}

impl ControlChannel {
    pub fn new(socket_path: Utf8PathBuf, handler: Arc<dyn CommandHandler>) -> (Self, ControlChannelSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                socket_path,
                handler,
                event_rx: rx,
                connected: Arc::new(Mutex::new(false)),
            },
            ControlChannelSink { tx },
        )
    }

    /// Whether a client is currently attached, mostly useful for tests.
    pub fn is_connected(&self) -> bool {
        *self.connected.lock()
    }
}

#[async_trait::async_trait]
impl Task for ControlChannel {
    type Output = Result<()>;

    const NAME: &'static str = "extsock::control_channel";

    async fn run(mut self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let std_listener =
            bind_with_backlog(&self.socket_path).map_err(|error| ExtsockError::socket_failure(error.to_string()))?;
        let listener =
            UnixListener::from_std(std_listener).map_err(|error| ExtsockError::socket_failure(error.to_string()))?;

        tracing::info!(path = %self.socket_path, "control channel listening");

        let mut reader: Option<OwnedReadHalf> = None;
        let mut writer: Option<OwnedWriteHalf> = None;

        loop {
            tokio::select! {
                _ = shutdown_signal.wait() => {
                    tracing::info!("control channel shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            tracing::info!("control channel client connected");
                            let (r, w) = split_stream(stream);
                            reader = Some(r);
                            writer = Some(w);
                            *self.connected.lock() = true;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "failed to accept control channel client");
                        }
                    }
                }
                maybe_line = recv_maybe(&mut reader), if reader.is_some() => {
                    match maybe_line {
                        Ok(Some(line)) if !line.is_empty() => {
                            let ack = match self.handler.handle(&line) {
                                Ok(()) => "OK\n".to_owned(),
                                Err(error) => format!("ERR {error}\n"),
                            };
                            if let Some(w) = writer.as_mut() {
                                if let Err(error) = w.write_all(ack.as_bytes()).await {
                                    if !is_peer_gone(&error) {
                                        tracing::warn!(%error, "failed to send ack");
                                    }
                                    reader = None;
                                    writer = None;
                                    *self.connected.lock() = false;
                                }
                            }
                        }
                        Ok(Some(_empty)) => {}
                        Ok(None) => {
                            tracing::info!("control channel client disconnected");
                            reader = None;
                            writer = None;
                            *self.connected.lock() = false;
                        }
                        Err(error) => {
                            tracing::warn!(%error, "control channel recv error");
                            reader = None;
                            writer = None;
                            *self.connected.lock() = false;
                        }
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    if let Some(w) = writer.as_mut() {
                        let mut line = event.to_string();
                        line.push('\n');
                        if let Err(error) = w.write_all(line.as_bytes()).await {
                            if !is_peer_gone(&error) {
                                tracing::warn!(%error, "failed to publish event");
                            }
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

fn split_stream(stream: UnixStream) -> (OwnedReadHalf, OwnedWriteHalf) {
    stream.into_split()
}

async fn recv_maybe(reader: &mut Option<OwnedReadHalf>) -> std::io::Result<Option<String>> {
    match reader {
        Some(r) => recv_one(r).await,
        None => std::future::pending().await,
    }
}

fn is_peer_gone(error: &std::io::Error) -> bool {
    matches!(error.kind(), std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset)
}
