//! Terminal bridge: one (PTY, WebSocket) pair per attached session.
//!
//! The bridge owns the bidirectional byte stream between a remote socket and
//! a pseudo-terminal running the multiplexer's attach command. PTY output is
//! batched and flow-controlled; socket input is forwarded verbatim; a
//! heartbeat force-closes dead peers; and a periodic reaper catches sockets
//! whose close notification was lost. Teardown is idempotent and guarantees
//! the PTY child is gone within the kill grace period.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Batch window for PTY output.
const BATCH_INTERVAL: Duration = Duration::from_millis(16);
/// Flushes are skipped while more than this many bytes sit unsent on the
/// socket writer.
const PENDING_LIMIT: usize = 64 * 1024;
/// Ceiling on buffered PTY output per connection. Exceeding it drops the
/// buffer, keeping only the newest chunk.
const BUFFER_LIMIT: usize = 1024 * 1024;
/// Reaper scan interval.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);
/// Grace between SIGTERM and SIGKILL during teardown.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// PTY read chunk size.
const PTY_READ_BUF: usize = 8 * 1024;
/// Bound on in-flight PTY chunks between the reader thread and the pump.
const PTY_CHANNEL_CAP: usize = 64;

/// Close code/reason for a second bridge on an already-attached session.
pub const ALREADY_ATTACHED_CODE: u16 = 4409;
pub const ALREADY_ATTACHED_REASON: &str = "Session already has an active terminal connection";

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub heartbeat: Duration,
    pub max_missed_pongs: u32,
    /// Argv template for the multiplexer attach command; `{tab}` is replaced
    /// with the tab name.
    pub attach_command: Vec<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(30),
            max_missed_pongs: 3,
            attach_command: ["tmux", "attach-session", "-t", "{tab}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Control messages arriving as WebSocket text frames. Unknown tags and
/// malformed payloads collapse to a no-op.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    #[serde(other)]
    Noop,
}

fn parse_control(text: &str) -> ControlMessage {
    serde_json::from_str(text).unwrap_or(ControlMessage::Noop)
}

enum Outbound {
    Frame(Vec<u8>),
    Ping,
    Pong(Vec<u8>),
    Close { code: u16, reason: &'static str },
    Shutdown,
}

enum PtyEvent {
    Data(Vec<u8>),
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    PtyExit,
    SocketClosed,
    SocketError,
    Liveness,
    Stopped,
}

/// State shared between the pump, the registry, the reaper and teardown.
struct BridgeHandle {
    session_id: String,
    cleaned_up: AtomicBool,
    socket_open: Arc<AtomicBool>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    child_pid: Option<u32>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: Notify,
}

impl BridgeHandle {
    fn signal_term(&self) {
        if let Some(pid) = self.child_pid {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    fn kill_if_alive(&self) {
        let mut child = self.child.lock().unwrap();
        if !matches!(child.try_wait(), Ok(Some(_))) {
            if let Err(e) = child.kill() {
                debug!(session_id = %self.session_id, error = %e, "SIGKILL escalation failed");
            }
        }
    }
}

/// Registry of live bridges plus the reaper. At most one bridge exists per
/// session id at any instant.
#[derive(Clone)]
pub struct TerminalBridges {
    inner: Arc<BridgesShared>,
}

struct BridgesShared {
    settings: BridgeSettings,
    active: StdMutex<HashMap<String, Arc<BridgeHandle>>>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl crate::tmux::ActiveBridges for TerminalBridges {
    fn has_active(&self, session_id: &str) -> bool {
        self.inner.active.lock().unwrap().contains_key(session_id)
    }
}

impl TerminalBridges {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            inner: Arc::new(BridgesShared {
                settings,
                active: StdMutex::new(HashMap::new()),
                reaper: StdMutex::new(None),
            }),
        }
    }

    /// Single source of truth for the manager's first conflict check.
    pub fn has_active(&self, session_id: &str) -> bool {
        crate::tmux::ActiveBridges::has_active(self, session_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    /// Install the periodic reaper.
    pub fn start(&self) {
        let shared = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAPER_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                shared.reap();
            }
        });
        *self.inner.reaper.lock().unwrap() = Some(task);
    }

    /// Cancel the reaper and tear down every bridge.
    pub fn stop(&self) {
        if let Some(task) = self.inner.reaper.lock().unwrap().take() {
            task.abort();
        }
        let all: Vec<_> = self.inner.active.lock().unwrap().values().cloned().collect();
        for handle in all {
            self.inner.cleanup(&handle, EndReason::Stopped);
        }
    }

    /// Bind `socket` to a PTY attached to `tab_name` for the lifetime of the
    /// connection. Returns when the bridge is torn down; false means the
    /// attach was refused (already bridged, or the PTY failed to spawn) and
    /// the socket was closed with the matching code.
    pub async fn attach(
        &self,
        session_id: &str,
        tab_name: &str,
        mut socket: WebSocket,
        cols: u16,
        rows: u16,
    ) -> bool {
        if self.has_active(session_id) {
            close_socket(&mut socket, ALREADY_ATTACHED_CODE, ALREADY_ATTACHED_REASON).await;
            return false;
        }

        let pty = match spawn_pty(&self.inner.settings.attach_command, tab_name, cols, rows) {
            Ok(p) => p,
            Err(e) => {
                warn!(session_id, tab = %tab_name, error = %e, "PTY spawn failed");
                close_socket(&mut socket, 4500, "Failed to open terminal").await;
                return false;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let socket_open = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(BridgeHandle {
            session_id: session_id.to_string(),
            cleaned_up: AtomicBool::new(false),
            socket_open: Arc::clone(&socket_open),
            child_pid: pty.child.process_id(),
            child: StdMutex::new(pty.child),
            outbound: outbound_tx,
            shutdown: Notify::new(),
        });

        let already_attached = {
            // Re-check under the map lock: insertion is atomic with respect
            // to `has_active` reads.
            let mut active = self.inner.active.lock().unwrap();
            let already_attached = active.contains_key(session_id);
            if !already_attached {
                active.insert(session_id.to_string(), Arc::clone(&handle));
            }
            already_attached
        };
        if already_attached {
            handle.signal_term();
            handle.kill_if_alive();
            close_socket(&mut socket, ALREADY_ATTACHED_CODE, ALREADY_ATTACHED_REASON).await;
            return false;
        }
        info!(session_id, tab = %tab_name, cols, rows, "Terminal bridge opened");

        let (sink, stream) = socket.split();
        let sender = tokio::spawn(sender_task(
            sink,
            outbound_rx,
            Arc::clone(&pending),
            Arc::clone(&socket_open),
        ));

        let (pty_tx, pty_rx) = mpsc::channel(PTY_CHANNEL_CAP);
        let reader = pty.reader;
        std::thread::spawn(move || pty_reader_loop(reader, pty_tx));

        let reason = pump(
            stream,
            pty_rx,
            pty.writer,
            pty.master,
            &handle,
            pending,
            &self.inner.settings,
        )
        .await;

        info!(session_id, reason = ?reason, "Terminal bridge ended");
        self.inner.cleanup(&handle, reason);
        let _ = sender.await;
        true
    }
}

impl BridgesShared {
    /// Idempotent teardown. Safe to call from any termination path, any
    /// number of times; only the first call for the currently-registered
    /// bridge does work.
    fn cleanup(&self, handle: &Arc<BridgeHandle>, reason: EndReason) {
        if handle.cleaned_up.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut active = self.active.lock().unwrap();
            match active.get(&handle.session_id) {
                Some(current) if Arc::ptr_eq(current, handle) => {
                    active.remove(&handle.session_id);
                }
                // A newer bridge has taken over the id; nothing to do.
                _ => return,
            }
        }
        if handle.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        handle.signal_term();
        let escalate = Arc::clone(handle);
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            escalate.kill_if_alive();
        });

        if reason == EndReason::PtyExit && handle.socket_open.load(Ordering::SeqCst) {
            let _ = handle.outbound.send(Outbound::Close {
                code: 1000,
                reason: "Terminal session ended",
            });
        } else {
            let _ = handle.outbound.send(Outbound::Shutdown);
        }
        // Stops the pump when teardown came from the reaper or daemon stop.
        handle.shutdown.notify_waiters();
        debug!(session_id = %handle.session_id, ?reason, "Bridge cleaned up");
    }

    /// Tear down bridges whose socket died without a close callback.
    fn reap(&self) {
        let stale: Vec<_> = self
            .active
            .lock()
            .unwrap()
            .values()
            .filter(|h| !h.socket_open.load(Ordering::SeqCst))
            .cloned()
            .collect();
        for handle in stale {
            warn!(session_id = %handle.session_id, "Reaping bridge with dead socket");
            self.cleanup(&handle, EndReason::SocketClosed);
        }
    }
}

struct PtyHandles {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
    reader: Box<dyn Read + Send>,
}

fn spawn_pty(
    attach_command: &[String],
    tab_name: &str,
    cols: u16,
    rows: u16,
) -> Result<PtyHandles, String> {
    let pair = native_pty_system()
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| e.to_string())?;

    let argv: Vec<String> = attach_command
        .iter()
        .map(|a| a.replace("{tab}", tab_name))
        .collect();
    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.cwd(std::env::var("HOME").unwrap_or_else(|_| "/".to_string()));

    let child = pair.slave.spawn_command(cmd).map_err(|e| e.to_string())?;
    let writer = pair.master.take_writer().map_err(|e| e.to_string())?;
    let reader = pair.master.try_clone_reader().map_err(|e| e.to_string())?;

    Ok(PtyHandles {
        master: pair.master,
        child,
        writer,
        reader,
    })
}

/// Blocking PTY reads on a dedicated thread. A full channel means the pump
/// is backed up; the chunk is dropped rather than letting memory grow.
fn pty_reader_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<PtyEvent>) {
    let mut buf = [0u8; PTY_READ_BUF];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => {
                let _ = tx.blocking_send(PtyEvent::Exited);
                return;
            }
            Ok(n) => match tx.try_send(PtyEvent::Data(buf[..n].to_vec())) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            },
        }
    }
}

/// Single writer for the socket: batched output frames, pings, and the
/// final close all leave through here, preserving byte order.
async fn sender_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<AtomicUsize>,
    socket_open: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        let result = match msg {
            Outbound::Frame(data) => {
                let len = data.len();
                let sent = sink.send(Message::Binary(data.into())).await;
                pending.fetch_sub(len, Ordering::SeqCst);
                sent
            }
            Outbound::Ping => sink.send(Message::Ping(Vec::new().into())).await,
            Outbound::Pong(data) => sink.send(Message::Pong(data.into())).await,
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
            Outbound::Shutdown => break,
        };
        if result.is_err() {
            break;
        }
    }
    socket_open.store(false, Ordering::SeqCst);
}

/// The bridge event loop: PTY output, socket traffic, the batch timer and
/// the heartbeat, multiplexed until any termination condition fires.
async fn pump(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    mut pty_rx: mpsc::Receiver<PtyEvent>,
    mut pty_writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    handle: &Arc<BridgeHandle>,
    pending: Arc<AtomicUsize>,
    settings: &BridgeSettings,
) -> EndReason {
    let mut buffer = BatchBuffer::new(BUFFER_LIMIT);
    let mut flush_at: Option<tokio::time::Instant> = None;
    let mut missed_pongs: u32 = 0;
    let mut heartbeat = tokio::time::interval(settings.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = pty_rx.recv() => match event {
                Some(PtyEvent::Data(chunk)) => {
                    if buffer.push(chunk) {
                        debug!(session_id = %handle.session_id, "Dropped buffered output for slow consumer");
                    }
                    if flush_at.is_none() {
                        flush_at = Some(tokio::time::Instant::now() + BATCH_INTERVAL);
                    }
                }
                Some(PtyEvent::Exited) | None => return EndReason::PtyExit,
            },

            _ = async { tokio::time::sleep_until(flush_at.unwrap()).await }, if flush_at.is_some() => {
                if pending.load(Ordering::SeqCst) > PENDING_LIMIT {
                    // Socket writer is backed up; try again next interval.
                    flush_at = Some(tokio::time::Instant::now() + BATCH_INTERVAL);
                } else {
                    let frame = buffer.take();
                    if !frame.is_empty() {
                        pending.fetch_add(frame.len(), Ordering::SeqCst);
                        if handle.outbound.send(Outbound::Frame(frame)).is_err() {
                            return EndReason::SocketClosed;
                        }
                    }
                    flush_at = None;
                }
            },

            _ = heartbeat.tick() => {
                if !handle.socket_open.load(Ordering::SeqCst) {
                    return EndReason::SocketClosed;
                }
                missed_pongs += 1;
                if missed_pongs > settings.max_missed_pongs {
                    warn!(session_id = %handle.session_id, missed_pongs, "Liveness lost; closing socket");
                    return EndReason::Liveness;
                }
                if handle.outbound.send(Outbound::Ping).is_err() {
                    return EndReason::SocketClosed;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if pty_writer.write_all(&data).and_then(|_| pty_writer.flush()).is_err() {
                        return EndReason::PtyExit;
                    }
                }
                Some(Ok(Message::Text(text))) => match parse_control(&text) {
                    ControlMessage::Resize { cols, rows } if cols > 0 && rows > 0 => {
                        if let Err(e) = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 }) {
                            debug!(session_id = %handle.session_id, error = %e, "Resize failed");
                        }
                    }
                    _ => {}
                },
                Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                Some(Ok(Message::Ping(data))) => {
                    let _ = handle.outbound.send(Outbound::Pong(data.to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    handle.socket_open.store(false, Ordering::SeqCst);
                    return EndReason::SocketClosed;
                }
                Some(Err(e)) => {
                    debug!(session_id = %handle.session_id, error = %e, "Socket receive error");
                    handle.socket_open.store(false, Ordering::SeqCst);
                    return EndReason::SocketError;
                }
            },

            _ = handle.shutdown.notified() => return EndReason::Stopped,
        }
    }
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Ordered chunk buffer with a hard byte ceiling. Exceeding the ceiling
/// drops everything buffered so far and keeps only the incoming chunk, so
/// memory stays bounded and the freshest output survives.
struct BatchBuffer {
    chunks: Vec<Vec<u8>>,
    len: usize,
    limit: usize,
}

impl BatchBuffer {
    fn new(limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            limit,
        }
    }

    /// Returns true when previously buffered output was dropped.
    fn push(&mut self, chunk: Vec<u8>) -> bool {
        let dropped = self.len + chunk.len() > self.limit && self.len > 0;
        if dropped {
            self.chunks.clear();
            self.len = 0;
        }
        self.len += chunk.len();
        self.chunks.push(chunk);
        dropped
    }

    /// Concatenate and drain everything buffered.
    fn take(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.len = 0;
        out
    }
}
