//! Remote module access: a single-endpoint RPC channel over TCP that
//! transparently exposes activated modules to peer instances.
//!
//! The plain channel is trusting: anyone who can reach the socket can drive
//! every shared module. Enable TLS (certfile/keyfile on both sides) for
//! anything beyond localhost lab setups.

pub mod client;
pub mod protocol;
pub mod server;

use std::io::{Read, Write};
use std::net::TcpStream;

/// Stream carrying frames: plain TCP or a TLS session on either side.
pub(crate) enum Channel {
    Plain(TcpStream),
    ServerTls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
    ClientTls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Channel::Plain(stream) => stream.read(buf),
            Channel::ServerTls(stream) => stream.read(buf),
            Channel::ClientTls(stream) => stream.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Channel::Plain(stream) => stream.write(buf),
            Channel::ServerTls(stream) => stream.write(buf),
            Channel::ClientTls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Channel::Plain(stream) => stream.flush(),
            Channel::ServerTls(stream) => stream.flush(),
            Channel::ClientTls(stream) => stream.flush(),
        }
    }
}
