//! The remote module server.
//!
//! Binds a TCP listener when `global.remote_modules_server` is configured
//! and serves the protocol operations against the local module manager.
//! Every connection runs on its own thread with its own handle table;
//! handles are revoked when the module deactivates or reloads underneath
//! them, and a disconnecting peer releases everything it acquired.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::RemoteServerConfig;
use crate::error::{CoreError, Result};
use crate::manager::{ManagerEvent, ModuleManager};
use crate::remote::protocol::{self, Request, RequestFrame, Response, ResponseFrame};
use crate::remote::Channel;

struct HandleEntry {
    module: String,
    generation: u64,
}

struct ServerInner {
    manager: ModuleManager,
    address: String,
    port: u16,
    tls: Option<Arc<rustls::ServerConfig>>,
    running: AtomicBool,
    bound: Mutex<Option<SocketAddr>>,
}

/// Listener half of the remote module channel.
pub struct RemoteModuleServer {
    inner: Arc<ServerInner>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RemoteModuleServer {
    pub fn new(manager: ModuleManager, config: &RemoteServerConfig) -> Result<Self> {
        let tls = match (&config.certfile, &config.keyfile) {
            (Some(certfile), Some(keyfile)) => Some(load_server_tls(certfile, keyfile)?),
            _ => {
                warn!(
                    address = %config.address,
                    port = config.port,
                    "remote module server runs without TLS; the channel trusts every peer"
                );
                None
            }
        };
        Ok(Self {
            inner: Arc::new(ServerInner {
                manager,
                address: config.address.clone(),
                port: config.port,
                tls,
                running: AtomicBool::new(false),
                bound: Mutex::new(None),
            }),
            accept_thread: Mutex::new(None),
        })
    }

    /// Binds the listener and starts accepting peers.
    pub fn start(&self) -> Result<()> {
        let listener = TcpListener::bind((self.inner.address.as_str(), self.inner.port))?;
        let bound = listener.local_addr()?;
        *self.inner.bound.lock().expect("server lock poisoned") = Some(bound);
        self.inner.running.store(true, Ordering::SeqCst);
        info!(address = %bound, tls = self.inner.tls.is_some(), "remote module server listening");

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("remote-server".to_string())
            .spawn(move || accept_loop(inner, listener))?;
        *self.accept_thread.lock().expect("server lock poisoned") = Some(handle);
        Ok(())
    }

    /// Address the listener actually bound to (useful with port 0 in tests).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.bound.lock().expect("server lock poisoned")
    }

    /// Stops accepting and joins the accept loop. Connections drain as the
    /// peers disconnect or hit the dead socket.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(addr) = self.local_addr() {
            // Wake the blocking accept.
            let _ = TcpStream::connect(addr);
        }
        if let Some(handle) = self.accept_thread.lock().expect("server lock poisoned").take() {
            let _ = handle.join();
        }
        info!("remote module server stopped");
    }
}

impl Drop for RemoteModuleServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if inner.running.load(Ordering::SeqCst) {
                    warn!(%err, "accept failed");
                    continue;
                }
                break;
            }
        };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        let inner = inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("remote-peer-{peer}"))
            .spawn(move || serve_connection(inner, stream, peer));
        if let Err(err) = spawned {
            warn!(%err, "could not spawn connection thread");
        }
    }
}

fn serve_connection(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let mut channel = match upgrade(&inner, stream, peer) {
        Ok(channel) => channel,
        Err(err) => {
            warn!(%peer, %err, "connection setup failed");
            return;
        }
    };
    info!(%peer, "remote session opened");
    inner.manager.emit(ManagerEvent::RemoteSessionOpened {
        peer: peer.to_string(),
    });

    let mut handles: HashMap<u64, HandleEntry> = HashMap::new();
    let mut next_handle: u64 = 1;

    loop {
        let frame: RequestFrame = match protocol::recv(&mut channel) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%peer, %err, "remote session closing");
                break;
            }
        };
        let response = handle_request(&inner, &mut handles, &mut next_handle, frame.request);
        let reply = ResponseFrame {
            request_id: frame.request_id,
            response,
        };
        if let Err(err) = protocol::send(&mut channel, &reply) {
            warn!(%peer, %err, "sending response failed");
            break;
        }
    }

    // The peer is gone; every module it acquired loses one reference.
    for entry in handles.into_values() {
        inner.manager.release_remote(&entry.module);
    }
    inner.manager.emit(ManagerEvent::RemoteSessionClosed {
        peer: peer.to_string(),
    });
    info!(%peer, "remote session closed");
}

fn handle_request(
    inner: &ServerInner,
    handles: &mut HashMap<u64, HandleEntry>,
    next_handle: &mut u64,
    request: Request,
) -> Response {
    match dispatch(inner, handles, next_handle, request) {
        Ok(response) => response,
        Err(err) => Response::from_error(&err),
    }
}

fn dispatch(
    inner: &ServerInner,
    handles: &mut HashMap<u64, HandleEntry>,
    next_handle: &mut u64,
    request: Request,
) -> Result<Response> {
    match request {
        Request::ListRemotable => Ok(Response::Remotable {
            modules: inner.manager.list_remotable(),
        }),
        Request::Acquire { module } => {
            let (generation, interfaces) = inner.manager.acquire_remote(&module)?;
            let handle = *next_handle;
            *next_handle += 1;
            handles.insert(
                handle,
                HandleEntry {
                    module: module.clone(),
                    generation,
                },
            );
            Ok(Response::Acquired {
                handle,
                module,
                interfaces,
            })
        }
        Request::Release { handle } => {
            let entry = handles
                .remove(&handle)
                .ok_or(CoreError::StaleHandle { handle })?;
            inner.manager.release_remote(&entry.module);
            Ok(Response::Released)
        }
        Request::Call { handle, attr, args } => {
            let entry = resolve(inner, handles, handle)?;
            let value = inner.manager.port(&entry)?.call(&attr, args)?;
            Ok(Response::Value { value })
        }
        Request::GetAttr { handle, attr } => {
            let entry = resolve(inner, handles, handle)?;
            let value = inner.manager.port(&entry)?.read_attr(&attr)?;
            Ok(Response::Value { value })
        }
        Request::SetAttr { handle, attr, value } => {
            let entry = resolve(inner, handles, handle)?;
            inner.manager.port(&entry)?.write_attr(&attr, value)?;
            Ok(Response::Done)
        }
    }
}

/// Validates a handle against the module's current activation generation so
/// reloads and deactivations invalidate outstanding handles.
fn resolve(
    inner: &ServerInner,
    handles: &mut HashMap<u64, HandleEntry>,
    handle: u64,
) -> Result<String> {
    let entry = handles.get(&handle).ok_or(CoreError::StaleHandle { handle })?;
    if let Err(err) = inner
        .manager
        .check_generation(&entry.module, entry.generation, handle)
    {
        handles.remove(&handle);
        return Err(err);
    }
    Ok(entry.module.clone())
}

fn upgrade(inner: &ServerInner, stream: TcpStream, peer: SocketAddr) -> Result<Channel> {
    stream.set_nodelay(true)?;
    match &inner.tls {
        None => Ok(Channel::Plain(stream)),
        Some(config) => {
            let connection = rustls::ServerConnection::new(config.clone()).map_err(|err| {
                CoreError::Transport {
                    peer: peer.to_string(),
                    reason: format!("TLS session setup failed: {err}"),
                }
            })?;
            Ok(Channel::ServerTls(Box::new(rustls::StreamOwned::new(
                connection, stream,
            ))))
        }
    }
}

fn load_server_tls(certfile: &Path, keyfile: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(certfile)?))
        .collect::<std::io::Result<_>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(keyfile)?))?
        .ok_or_else(|| CoreError::Transport {
            peer: "<local>".to_string(),
            reason: format!("no private key found in {}", keyfile.display()),
        })?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| CoreError::Transport {
            peer: "<local>".to_string(),
            reason: format!("invalid certificate/key pair: {err}"),
        })?;
    Ok(Arc::new(config))
}
