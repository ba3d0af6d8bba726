//! # Connection Module
//!
//! The byte stream the debug server talks through, independent of its
//! transport. The server only needs a blocking read that hands over
//! whatever arrived and a best effort write; TCP is the stock transport,
//! tests substitute in-memory implementations.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use tracing::info;

use crate::errors::Result;

/// Blocking byte source of a debug session
pub trait DebugReader {
    /// Blocks until some bytes arrive and returns them
    ///
    /// # Errors
    ///
    /// Fails when the peer disconnected or the transport broke.
    fn read(&mut self) -> Result<Vec<u8>>;
}

/// Byte sink of a debug session
pub trait DebugWriter {
    /// Writes all of `data`
    ///
    /// # Errors
    ///
    /// Fails when the transport broke.
    fn write(&mut self, data: &[u8]) -> Result<()>;
}

/// Reading half of a TCP debug connection
pub struct TcpDebugReader {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl DebugReader for TcpDebugReader {
    fn read(&mut self) -> Result<Vec<u8>> {
        let length = self.stream.read(&mut self.buffer)?;
        if length == 0 {
            return Err(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "debugger disconnected",
            )
            .into());
        }
        Ok(self.buffer[..length].to_vec())
    }
}

/// Writing half of a TCP debug connection
pub struct TcpDebugWriter {
    stream: TcpStream,
}

impl DebugWriter for TcpDebugWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        Ok(())
    }
}

/// Waits for one debugger to connect on `listen_address`
///
/// # Errors
///
/// Fails if the address cannot be bound or the accept fails.
pub fn accept_connection(listen_address: &str) -> Result<(TcpDebugReader, TcpDebugWriter)> {
    let listener = TcpListener::bind(listen_address)?;
    info!("waiting for a debugger on {listen_address}");
    let (stream, peer) = listener.accept()?;
    info!("debugger connected from {peer}");
    stream.set_nodelay(true)?;
    let write_stream = stream.try_clone()?;
    Ok((
        TcpDebugReader {
            stream,
            buffer: vec![0u8; 4096],
        },
        TcpDebugWriter {
            stream: write_stream,
        },
    ))
}
