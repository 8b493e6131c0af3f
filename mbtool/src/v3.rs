// src/v3.rs

//! Version 3 of the daemon interface.
//!
//! Requests and responses are opaque, schema-encoded messages. This module
//! owns their framing: a 4-byte length followed by the message, capped at
//! [`constants::MAX_MESSAGE_SIZE`]. What the messages mean is up to the
//! [`RequestHandler`].

use anyhow::{Context, Result, bail};
use log::{debug, error};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;

use crate::constants;
use crate::utils::UnixStreamExt;

/// Serves a connection once its protocol version has been accepted.
pub trait VersionHandler {
    /// Runs until the peer disconnects or the session fails.
    fn serve(&self, stream: &mut UnixStream) -> Result<()>;
}

/// Produces the response to one v3 request.
pub trait RequestHandler {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>>;
}

/// Request handler for builds without a v3 command set. Every request ends
/// the session.
pub struct NoCommands;

impl RequestHandler for NoCommands {
    fn handle(&self, request: &[u8]) -> Result<Vec<u8>> {
        bail!("No v3 command set; dropping {} byte request", request.len())
    }
}

/// Reads one message. `Ok(None)` means the peer closed the connection
/// cleanly between messages; EOF inside a length prefix is an error.
pub fn read_message(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    stream
        .read_exact(&mut len[1..])
        .context("Truncated message length")?;

    let len = i32::from_ne_bytes(len);
    let size = match usize::try_from(len) {
        Ok(size) if size <= constants::MAX_MESSAGE_SIZE => size,
        _ => bail!("Invalid message size: {len}"),
    };

    let mut buf = vec![0u8; size];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_message(stream: &mut UnixStream, message: &[u8]) -> Result<()> {
    if message.len() > constants::MAX_MESSAGE_SIZE {
        bail!("Message too large: {} bytes", message.len());
    }
    stream.write_i32(message.len() as i32)?;
    stream.write_all(message)?;
    Ok(())
}

/// Request/response loop for v3 clients.
pub struct MessageLoop<H> {
    handler: H,
}

impl<H: RequestHandler> MessageLoop<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

impl<H: RequestHandler> VersionHandler for MessageLoop<H> {
    fn serve(&self, stream: &mut UnixStream) -> Result<()> {
        loop {
            let Some(request) = read_message(stream)? else {
                debug!("[Version 3] Client disconnected");
                return Ok(());
            };

            let response = match self.handler.handle(&request) {
                Ok(r) => r,
                Err(e) => {
                    error!("[Version 3] Failed to handle request: {e:?}");
                    return Err(e);
                }
            };

            write_message(stream, &response)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, request: &[u8]) -> Result<Vec<u8>> {
            Ok(request.iter().rev().copied().collect())
        }
    }

    #[test]
    fn serves_until_peer_closes() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || MessageLoop::new(Echo).serve(&mut server));

        write_message(&mut client, b"abc").unwrap();
        assert_eq!(read_message(&mut client).unwrap().unwrap(), b"cba");
        write_message(&mut client, b"").unwrap();
        assert_eq!(read_message(&mut client).unwrap().unwrap(), b"");
        drop(client);

        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn oversize_and_negative_lengths_end_the_session() {
        for len in [-1i32, constants::MAX_MESSAGE_SIZE as i32 + 1] {
            let (mut client, mut server) = UnixStream::pair().unwrap();
            client.write_i32(len).unwrap();
            assert!(MessageLoop::new(Echo).serve(&mut server).is_err());
        }
    }

    #[test]
    fn handler_failure_ends_the_session() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        write_message(&mut client, b"request").unwrap();
        assert!(MessageLoop::new(NoCommands).serve(&mut server).is_err());
    }

    #[test]
    fn truncated_length_is_an_error() {
        for partial in [&[1u8][..], &[1, 0][..], &[1, 0, 0][..]] {
            let (mut client, mut server) = UnixStream::pair().unwrap();
            client.write_all(partial).unwrap();
            drop(client);
            assert!(read_message(&mut server).is_err());
        }
    }

    #[test]
    fn eof_between_messages_is_a_clean_end() {
        let (client, mut server) = UnixStream::pair().unwrap();
        drop(client);
        assert!(read_message(&mut server).unwrap().is_none());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let (mut client, mut server) = UnixStream::pair().unwrap();
        client.write_i32(10).unwrap();
        client.write_all(b"short").unwrap();
        drop(client);
        assert!(read_message(&mut server).is_err());
    }
}
