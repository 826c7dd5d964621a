//! RPC Surface
//!
//! Length-delimited JSON over a local stream socket: every frame is a
//! little-endian u32 byte count followed by one serialized message.
//! Requests are a tagged union; responses always carry a numeric error
//! code (0 is success) plus whatever payload the call produces.
//!
//! A fixed pool of worker threads serves connections handed over by the
//! acceptor. Caller identity comes from `SO_PEERCRED`; names on the wire
//! are relative to the caller's namespace prefix and resolved at the
//! boundary, so the holder only ever sees absolute names.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use nix::sys::socket::getsockopt;
use nix::sys::socket::sockopt::PeerCredentials;
use serde::{Deserialize, Serialize};

use crate::cred::Cred;
use crate::error::{Error, ErrorKind};
use crate::events::Event;
use crate::holder::Holder;

/// Frames above this size are rejected as garbage.
const MAX_FRAME: u32 = 1 << 20;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create { name: String },
    Destroy { name: String },
    Start { name: String },
    Stop { name: String },
    Pause { name: String },
    Resume { name: String },
    Kill { name: String, signal: i32 },
    List {
        #[serde(default)]
        filter: Option<String>,
    },
    PropertyList,
    DataList,
    GetProperty { name: String, property: String },
    SetProperty {
        name: String,
        property: String,
        value: String,
    },
    GetData { name: String, data: String },
    Get {
        names: Vec<String>,
        variables: Vec<String>,
    },
    Wait {
        names: Vec<String>,
        timeout_ms: i64,
    },
    Version,
}

/// One `(variable, value-or-error)` cell of a batch get.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchValue {
    pub variable: String,
    pub error: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchEntry {
    pub name: String,
    pub values: Vec<BatchValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub error: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub described: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<Vec<BatchEntry>>,
    /// Wait: the container that died, empty on timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Response {
    pub fn ok() -> Response {
        Response::default()
    }

    pub fn with_value(value: impl Into<String>) -> Response {
        Response {
            value: Some(value.into()),
            ..Response::default()
        }
    }

    pub fn from_error(e: &Error) -> Response {
        Response {
            error: e.kind.code(),
            error_message: Some(e.message.clone()),
            ..Response::default()
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.error)
    }
}

// ============================================================================
// Framing
// ============================================================================

pub fn write_frame<T: Serialize>(stream: &mut impl Write, message: &T) -> Result<(), Error> {
    let body = serde_json::to_vec(message)
        .map_err(|e| Error::new(ErrorKind::Unknown, format!("encode: {}", e)))?;
    if body.len() as u32 > MAX_FRAME {
        return Err(Error::new(ErrorKind::Unknown, "frame too large"));
    }
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Read one frame; `Ok(None)` is a clean EOF between frames.
pub fn read_frame<T: for<'de> Deserialize<'de>>(
    stream: &mut impl Read,
) -> Result<Option<T>, Error> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME {
        return Err(Error::new(ErrorKind::Unknown, "frame too large"));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| Error::new(ErrorKind::Unknown, format!("decode: {}", e)))
}

// ============================================================================
// Router
// ============================================================================

/// Dispatch one request for one identified caller.
pub fn handle_request(
    holder: &Arc<Holder>,
    request: Request,
    cred: &Cred,
    client_pid: i32,
) -> Response {
    let result = route(holder, request, cred, client_pid);
    match result {
        Ok(response) => response,
        Err(e) => Response::from_error(&e),
    }
}

fn route(
    holder: &Arc<Holder>,
    request: Request,
    cred: &Cred,
    client_pid: i32,
) -> Result<Response, Error> {
    match request {
        Request::Create { name } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.create(&name, cred)?;
            Ok(Response::ok())
        }
        Request::Destroy { name } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.destroy(&name, cred)?;
            Ok(Response::ok())
        }
        Request::Start { name } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.start(&name, cred)?;
            Ok(Response::ok())
        }
        Request::Stop { name } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.stop(&name, cred)?;
            Ok(Response::ok())
        }
        Request::Pause { name } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.pause(&name, cred)?;
            Ok(Response::ok())
        }
        Request::Resume { name } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.resume(&name, cred)?;
            Ok(Response::ok())
        }
        Request::Kill { name, signal } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.kill(&name, signal, cred)?;
            Ok(Response::ok())
        }
        Request::List { filter } => {
            let names = holder
                .list(filter.as_deref())
                .into_iter()
                .map(|n| holder.relative_name(client_pid, &n))
                .filter(|n| !n.is_empty())
                .collect();
            Ok(Response {
                list: Some(names),
                ..Response::default()
            })
        }
        Request::PropertyList => Ok(Response {
            described: Some(
                crate::property::list()
                    .into_iter()
                    .map(|(n, d)| (n.to_string(), d.to_string()))
                    .collect(),
            ),
            ..Response::default()
        }),
        Request::DataList => Ok(Response {
            described: Some(
                crate::data::list()
                    .into_iter()
                    .map(|(n, d)| (n.to_string(), d.to_string()))
                    .collect(),
            ),
            ..Response::default()
        }),
        Request::GetProperty { name, property } => {
            let name = holder.resolve_name(client_pid, &name)?;
            let value = holder.get_property(&name, &property)?;
            Ok(Response::with_value(value))
        }
        Request::SetProperty {
            name,
            property,
            value,
        } => {
            let name = holder.resolve_name(client_pid, &name)?;
            holder.set_property(&name, &property, &value, cred)?;
            Ok(Response::ok())
        }
        Request::GetData { name, data } => {
            let name = holder.resolve_name(client_pid, &name)?;
            let value = holder.get_data(&name, &data)?;
            Ok(Response::with_value(value))
        }
        Request::Get { names, variables } => {
            let absolute: Vec<String> = names
                .iter()
                .map(|n| {
                    holder
                        .resolve_name(client_pid, n)
                        .unwrap_or_else(|_| n.clone())
                })
                .collect();

            let batch = holder
                .get_batch(&absolute, &variables)
                .into_iter()
                .zip(names)
                .map(|((_, values), requested)| BatchEntry {
                    name: requested,
                    values: values
                        .into_iter()
                        .map(|(variable, value)| match value {
                            Ok(value) => BatchValue {
                                variable,
                                error: 0,
                                value: Some(value),
                                error_message: None,
                            },
                            Err(e) => BatchValue {
                                variable,
                                error: e.kind.code(),
                                value: None,
                                error_message: Some(e.message),
                            },
                        })
                        .collect(),
                })
                .collect();

            Ok(Response {
                batch: Some(batch),
                ..Response::default()
            })
        }
        Request::Wait { names, timeout_ms } => {
            let patterns: Vec<String> = names
                .iter()
                .map(|n| {
                    if n == "*" {
                        "*".to_string()
                    } else {
                        holder
                            .resolve_name(client_pid, n)
                            .unwrap_or_else(|_| n.clone())
                    }
                })
                .collect();

            let (_waiter, rx) = holder.wait_register(patterns)?;

            let fired = if timeout_ms < 0 {
                rx.recv().ok()
            } else if timeout_ms == 0 {
                rx.try_recv().ok()
            } else {
                rx.recv_timeout(Duration::from_millis(timeout_ms as u64)).ok()
            };

            Ok(Response {
                name: Some(
                    fired
                        .map(|r| holder.relative_name(client_pid, &r.name))
                        .unwrap_or_default(),
                ),
                ..Response::default()
            })
        }
        Request::Version => Ok(Response::with_value(env!("CARGO_PKG_VERSION"))),
    }
}

// ============================================================================
// Server
// ============================================================================

/// Accepts connections and fans them out to the worker pool.
pub struct RpcServer {
    holder: Arc<Holder>,
    listener: UnixListener,
    conn_tx: Sender<UnixStream>,
    conn_rx: Receiver<UnixStream>,
}

impl RpcServer {
    pub fn bind(holder: Arc<Holder>) -> Result<RpcServer, Error> {
        let path = holder.context().config.socket_path.clone();
        let _ = std::fs::remove_file(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)?;

        // Clients are unprivileged by design.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;

        let (conn_tx, conn_rx) = crossbeam_channel::bounded(64);
        info!("listening on {}", path.display());

        Ok(RpcServer {
            holder,
            listener,
            conn_tx,
            conn_rx,
        })
    }

    /// Spawn the worker pool; returns their join handles.
    pub fn spawn_workers(&self, count: usize) -> Vec<std::thread::JoinHandle<()>> {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let holder = self.holder.clone();
            let conn_rx = self.conn_rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("rpc-worker-{}", index))
                    .spawn(move || {
                        while let Ok(stream) = conn_rx.recv() {
                            serve_connection(&holder, stream);
                        }
                    })
                    .expect("spawn rpc worker"),
            );
        }
        workers
    }

    /// Accept until the socket is shut down.
    pub fn accept_loop(&self) {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    if self.conn_tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("accept: {}", e);
                    break;
                }
            }
        }
    }
}

fn serve_connection(holder: &Arc<Holder>, mut stream: UnixStream) {
    let (cred, client_pid) = match peer_credentials(&stream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("peer credentials: {}", e);
            return;
        }
    };
    debug!("client connected: uid {} pid {}", cred.uid, client_pid);

    loop {
        let request: Request = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!("client read: {}", e);
                break;
            }
        };

        let response = handle_request(holder, request, &cred, client_pid);
        if let Err(e) = write_frame(&mut stream, &response) {
            debug!("client write: {}", e);
            break;
        }
    }
}

fn peer_credentials(stream: &UnixStream) -> Result<(Cred, i32), Error> {
    let creds = getsockopt(stream, PeerCredentials)?;
    Ok((Cred::new(creds.uid(), creds.gid()), creds.pid()))
}

/// Forward loop for the delivery thread: applies exits in arrival order
/// and acks each pid to the reaper once its container state is durable.
pub fn run_exit_delivery(
    holder: Arc<Holder>,
    delivery_rx: Receiver<Event>,
    ack_fd: std::os::fd::RawFd,
) {
    info!("exit delivery started");
    while let Ok(event) = delivery_rx.recv() {
        match event {
            Event::Exit { pid, status } => {
                let delivered = holder.deliver_exit(pid, status);
                if !delivered {
                    debug!("exit of untracked pid {} (status {})", pid, status);
                }
                // Ack regardless: the reaper must drop the pid from its
                // replay buffer either way.
                let bytes = pid.to_ne_bytes();
                // SAFETY: bytes lives across the call; ack_fd is the
                // inherited pipe, open for the daemon's lifetime.
                let n = unsafe {
                    libc::write(ack_fd, bytes.as_ptr() as *const libc::c_void, bytes.len())
                };
                if n != bytes.len() as isize {
                    warn!("ack of pid {} failed", pid);
                }
            }
            Event::Oom { name } => {
                holder.handle_event(Event::Oom { name });
            }
            Event::Shutdown => break,
            other => holder.handle_event(other),
        }
    }
    info!("exit delivery stopped");
}

/// Worker loop for timer-driven events.
pub fn run_event_worker(holder: Arc<Holder>, work_rx: Receiver<Event>) {
    while let Ok(event) = work_rx.recv() {
        if event == Event::Shutdown {
            break;
        }
        holder.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        let request = Request::SetProperty {
            name: "a".into(),
            property: "command".into(),
            value: "sleep 1".into(),
        };
        write_frame(&mut buf, &request).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, request);

        // Clean EOF after the single frame.
        let next: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<Option<Request>, Error> = read_frame(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn test_request_wire_shape() {
        let json = serde_json::to_string(&Request::Kill {
            name: "a".into(),
            signal: 9,
        })
        .unwrap();
        assert!(json.contains("\"op\":\"kill\""));
        assert!(json.contains("\"signal\":9"));

        let decoded: Request =
            serde_json::from_str("{\"op\":\"list\"}").unwrap();
        assert_eq!(decoded, Request::List { filter: None });
    }

    #[test]
    fn test_response_error_mapping() {
        let e = Error::new(ErrorKind::ContainerDoesNotExist, "no such container");
        let response = Response::from_error(&e);
        assert_eq!(response.kind(), ErrorKind::ContainerDoesNotExist);
        assert_eq!(response.error_message.as_deref(), Some("no such container"));

        assert_eq!(Response::ok().kind(), ErrorKind::Success);
    }

    #[test]
    fn test_response_payload_skips_empty() {
        let json = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(json, "{\"error\":0}");
    }
}
