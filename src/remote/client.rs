//! Client side of the remote module channel.
//!
//! A [`RemoteModuleClient`] owns one connection to a peer instance and
//! multiplexes request/response pairs over it. Acquired modules are driven
//! through [`RemotePort`], which presents the same [`ModulePort`] surface as
//! a local module. A transport failure marks the whole client broken; every
//! port on it then refuses use until the module is re-acquired over a fresh
//! connection.

use std::fs::File;
use std::io::BufReader;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls_pki_types::ServerName;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::module::ModuleState;
use crate::proxy::ModulePort;
use crate::remote::protocol::{self, Request, RequestFrame, Response, ResponseFrame};
use crate::remote::Channel;
use crate::yaml::Value;

/// Connection to one peer instance.
pub struct RemoteModuleClient {
    peer: String,
    channel: Mutex<Channel>,
    next_id: AtomicU32,
    broken: AtomicBool,
}

impl RemoteModuleClient {
    /// Connects to a peer. With `certfile` the channel is wrapped in TLS,
    /// trusting exactly the certificate(s) in that file (self-signed lab
    /// certificates are the norm). `timeout` bounds both the connect and
    /// every later call; a timed-out call aborts locally without any promise
    /// that the server stopped working on it.
    pub fn connect(
        address: &str,
        port: u16,
        certfile: Option<&Path>,
        timeout: Duration,
    ) -> Result<Arc<Self>> {
        let peer = format!("{address}:{port}");
        let transport_err = |reason: String| CoreError::Transport {
            peer: peer.clone(),
            reason,
        };

        let socket_addr = (address, port)
            .to_socket_addrs()
            .map_err(|err| transport_err(format!("address does not resolve: {err}")))?
            .next()
            .ok_or_else(|| transport_err("address does not resolve".to_string()))?;
        let stream = TcpStream::connect_timeout(&socket_addr, timeout)
            .map_err(|err| transport_err(format!("connect failed: {err}")))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let channel = match certfile {
            None => Channel::Plain(stream),
            Some(certfile) => {
                let config = client_tls_config(certfile, &peer)?;
                let server_name = ServerName::try_from(address.to_string())
                    .map_err(|err| transport_err(format!("bad server name: {err}")))?;
                let connection = rustls::ClientConnection::new(Arc::new(config), server_name)
                    .map_err(|err| transport_err(format!("TLS session setup failed: {err}")))?;
                Channel::ClientTls(Box::new(rustls::StreamOwned::new(connection, stream)))
            }
        };
        debug!(peer = %peer, tls = certfile.is_some(), "connected to remote module server");
        Ok(Arc::new(Self {
            peer,
            channel: Mutex::new(channel),
            next_id: AtomicU32::new(1),
            broken: AtomicBool::new(false),
        }))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Module names the peer shares.
    pub fn list_remotable(&self) -> Result<Vec<String>> {
        match self.request(Request::ListRemotable)? {
            Response::Remotable { modules } => Ok(modules),
            other => Err(self.unexpected(other)),
        }
    }

    /// Acquires a shared module, activating it on the peer if necessary.
    pub fn acquire(self: &Arc<Self>, module: &str) -> Result<Arc<RemotePort>> {
        match self.request(Request::Acquire {
            module: module.to_string(),
        })? {
            Response::Acquired {
                handle,
                module,
                interfaces,
            } => Ok(Arc::new(RemotePort {
                client: self.clone(),
                module,
                handle,
                interfaces,
            })),
            other => Err(self.unexpected(other)),
        }
    }

    /// Releases an acquired handle, dropping one server-side reference.
    pub fn release(&self, handle: u64) -> Result<()> {
        match self.request(Request::Release { handle })? {
            Response::Released => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    fn request(&self, request: Request) -> Result<Response> {
        if self.is_broken() {
            return Err(CoreError::Transport {
                peer: self.peer.clone(),
                reason: "connection marked broken after an earlier failure".to_string(),
            });
        }
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = RequestFrame {
            request_id,
            request,
        };
        let mut channel = self.channel.lock().expect("client lock poisoned");
        let exchange = (|| -> Result<ResponseFrame> {
            protocol::send(&mut *channel, &frame)?;
            protocol::recv(&mut *channel)
        })();
        drop(channel);

        let reply = match exchange {
            Ok(reply) => reply,
            Err(err) => {
                self.broken.store(true, Ordering::SeqCst);
                warn!(peer = %self.peer, %err, "remote exchange failed, marking connection broken");
                return Err(CoreError::Transport {
                    peer: self.peer.clone(),
                    reason: err.to_string(),
                });
            }
        };
        if reply.request_id != request_id {
            self.broken.store(true, Ordering::SeqCst);
            return Err(CoreError::Transport {
                peer: self.peer.clone(),
                reason: format!(
                    "response id {} does not match request id {request_id}",
                    reply.request_id
                ),
            });
        }
        match reply.response {
            Response::Error {
                class,
                message,
                trace,
            } => Err(CoreError::Remote {
                class: format!("remote.{class}"),
                message,
                trace,
            }),
            response => Ok(response),
        }
    }

    fn unexpected(&self, response: Response) -> CoreError {
        CoreError::Transport {
            peer: self.peer.clone(),
            reason: format!("unexpected response: {response:?}"),
        }
    }
}

/// Port to a module living on a peer instance. Call arguments and results
/// are serialized at the boundary; mutating a sent value on the server never
/// affects the caller's copy.
pub struct RemotePort {
    client: Arc<RemoteModuleClient>,
    module: String,
    handle: u64,
    interfaces: Vec<String>,
}

impl std::fmt::Debug for RemotePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePort")
            .field("peer", &self.client.peer())
            .field("module", &self.module)
            .field("handle", &self.handle)
            .finish()
    }
}

impl RemotePort {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.clone()
    }

    pub fn client(&self) -> &Arc<RemoteModuleClient> {
        &self.client
    }

    fn guard(&self) -> Result<()> {
        if self.client.is_broken() {
            return Err(CoreError::ProxyBroken {
                module: self.module.clone(),
            });
        }
        Ok(())
    }
}

impl ModulePort for RemotePort {
    fn target(&self) -> &str {
        &self.module
    }

    fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.interfaces.clone())
    }

    fn state(&self) -> Result<ModuleState> {
        // An acquired handle pins the module active on the serving side.
        self.guard()?;
        Ok(ModuleState::Idle)
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.guard()?;
        match self.client.request(Request::Call {
            handle: self.handle,
            attr: method.to_string(),
            args,
        })? {
            Response::Value { value } => Ok(value),
            other => Err(self.client.unexpected(other)),
        }
    }

    fn read_attr(&self, name: &str) -> Result<Value> {
        self.guard()?;
        match self.client.request(Request::GetAttr {
            handle: self.handle,
            attr: name.to_string(),
        })? {
            Response::Value { value } => Ok(value),
            other => Err(self.client.unexpected(other)),
        }
    }

    fn write_attr(&self, name: &str, value: Value) -> Result<()> {
        self.guard()?;
        match self.client.request(Request::SetAttr {
            handle: self.handle,
            attr: name.to_string(),
            value,
        })? {
            Response::Done => Ok(()),
            other => Err(self.client.unexpected(other)),
        }
    }
}

fn client_tls_config(certfile: &Path, peer: &str) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(certfile)?))
        .collect::<std::io::Result<_>>()?;
    let (added, _) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(CoreError::Transport {
            peer: peer.to_string(),
            reason: format!("no usable certificates in {}", certfile.display()),
        });
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
