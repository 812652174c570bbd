//! Minimal blocking ttrpc client over a unix socket.
//!
//! Frame layout: `u32 length | u32 stream id | u8 type | u8 flags` (big
//! endian), followed by `length` bytes of protobuf payload.

use prost::Message;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

use super::proto::{Request, Response};
use crate::error::RpcError;

pub(crate) const HEADER_LEN: usize = 10;
pub(crate) const MAX_MESSAGE_LEN: usize = 4 << 20;
pub(crate) const MESSAGE_TYPE_REQUEST: u8 = 0x1;
pub(crate) const MESSAGE_TYPE_RESPONSE: u8 = 0x2;

#[derive(Debug)]
pub(crate) struct Frame {
    pub stream_id: u32,
    pub kind: u8,
    pub payload: Vec<u8>,
}

pub(crate) fn write_frame(
    writer: &mut impl Write,
    stream_id: u32,
    kind: u8,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message of {} bytes exceeds ttrpc limit", payload.len()),
        ));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[4..8].copy_from_slice(&stream_id.to_be_bytes());
    header[8] = kind;
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()
}

pub(crate) fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let stream_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("ttrpc frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Frame {
        stream_id,
        kind: header[8],
        payload,
    })
}

/// A ttrpc channel. Calls from several threads serialize on the socket lock.
///
/// A transport error can leave a frame half read, so it poisons the channel:
/// the socket is shut down and every later call fails as a transport error.
pub struct Client {
    stream: Mutex<UnixStream>,
    next_stream_id: AtomicU32,
    timeout: Duration,
    broken: AtomicBool,
}

impl Client {
    pub fn new(stream: UnixStream, timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(Self {
            stream: Mutex::new(stream),
            // Client-initiated streams are odd.
            next_stream_id: AtomicU32::new(1),
            timeout,
            broken: AtomicBool::new(false),
        })
    }

    pub fn call<Req, Resp>(
        &self,
        service: &str,
        method: &'static str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let transport = |source: io::Error| RpcError::Transport { method, source };

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);
        let envelope = Request {
            service: service.to_string(),
            method: method.to_string(),
            payload: request.encode_to_vec(),
            timeout_nano: self.timeout.as_nanos().min(i64::MAX as u128) as i64,
        };

        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if self.broken.load(Ordering::SeqCst) {
            return Err(transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "ttrpc channel closed after an earlier transport failure",
            )));
        }
        trace!(service, method, stream_id, "ttrpc:call");
        if let Err(e) = write_frame(
            &mut *stream,
            stream_id,
            MESSAGE_TYPE_REQUEST,
            &envelope.encode_to_vec(),
        ) {
            return Err(self.poison(&stream, transport(e)));
        }

        let frame = loop {
            let frame = match read_frame(&mut *stream) {
                Ok(frame) => frame,
                Err(e) => return Err(self.poison(&stream, transport(e))),
            };
            if frame.stream_id == stream_id && frame.kind == MESSAGE_TYPE_RESPONSE {
                break frame;
            }
            // Late reply to an earlier call that timed out.
            trace!(
                stream_id = frame.stream_id,
                kind = frame.kind,
                "ttrpc:skipping frame"
            );
        };
        drop(stream);

        let response = Response::decode(frame.payload.as_slice())
            .map_err(|e| transport(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        if let Some(status) = response.status
            && status.code != 0
        {
            return Err(RpcError::Rejected {
                method,
                code: status.code,
                message: status.message,
            });
        }
        Resp::decode(response.payload.as_slice())
            .map_err(|e| transport(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    fn poison(&self, stream: &UnixStream, err: RpcError) -> RpcError {
        self.broken.store(true, Ordering::SeqCst);
        let _ = stream.shutdown(Shutdown::Both);
        err
    }

    /// Shut the socket down in both directions.
    pub fn close(&self) {
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 3, MESSAGE_TYPE_REQUEST, b"abc").unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[0, 0, 0, 3, 0, 0, 0, 3, 1, 0]);
        assert_eq!(&buf[HEADER_LEN..], b"abc");

        let frame = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.kind, MESSAGE_TYPE_REQUEST);
        assert_eq!(frame.payload, b"abc");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&((MAX_MESSAGE_LEN as u32) + 1).to_be_bytes());
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&[MESSAGE_TYPE_RESPONSE, 0]);
        let err = read_frame(&mut header.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_eof() {
        let err = read_frame(&mut [0u8, 0, 0].as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn timeout_mid_frame_closes_the_channel() {
        use super::super::proto::{ConnectRequest, ConnectResponse};
        use std::sync::mpsc;
        use std::thread;

        let (client_end, mut server_end) = UnixStream::pair().unwrap();
        let client = Client::new(client_end, Duration::from_millis(200)).unwrap();
        let (release, released) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let request = read_frame(&mut server_end).unwrap();
            // Header promising 20 bytes, then only part of the payload.
            let mut partial = Vec::new();
            partial.extend_from_slice(&20u32.to_be_bytes());
            partial.extend_from_slice(&request.stream_id.to_be_bytes());
            partial.extend_from_slice(&[MESSAGE_TYPE_RESPONSE, 0, 1, 2, 3]);
            server_end.write_all(&partial).unwrap();
            let _ = released.recv();
        });

        let request = ConnectRequest { id: "a".to_string() };
        let first = client
            .call::<_, ConnectResponse>("svc", "Connect", &request)
            .unwrap_err();
        assert!(first.is_transport());

        let second = client
            .call::<_, ConnectResponse>("svc", "Connect", &request)
            .unwrap_err();
        match second {
            RpcError::Transport { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::NotConnected)
            }
            other => panic!("expected transport error, got {other:?}"),
        }

        release.send(()).unwrap();
        server.join().unwrap();
    }
}
