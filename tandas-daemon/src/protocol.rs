//! Control-socket wire format and a blocking client.
//!
//! Each request and response is one JSON object. Responses are written one
//! per line; requests may arrive with or without separating whitespace, so
//! the server decodes them as a stream.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// Read and write deadline for client calls.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: i64,
}

impl Request {
    pub fn new(method: impl Into<String>, id: i64) -> Self {
        Self {
            method: method.into(),
            params: None,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub id: i64,
}

impl Response {
    pub fn ok(id: i64, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
            id,
        }
    }

    pub fn into_result(self) -> Result<Value, DaemonError> {
        match self.error {
            Some(message) => Err(DaemonError::Protocol(message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming decoder
// ---------------------------------------------------------------------------

/// Largest unfinished request a connection may buffer.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Incremental decoder for a byte stream of concatenated request objects.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    buf: Vec<u8>,
}

impl RequestDecoder {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The next complete request, or `Ok(None)` when more bytes are needed.
    ///
    /// An error means the stream is malformed and cannot be resynchronised.
    pub fn next_request(&mut self) -> Result<Option<Request>, serde_json::Error> {
        let start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        self.buf.drain(..start);
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Request>();
            let next = stream.next();
            (next, stream.byte_offset())
        };
        match next {
            Some(Ok(request)) => {
                self.buf.drain(..consumed);
                Ok(Some(request))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Bytes of an unfinished request are buffered.
    pub fn has_partial(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// The unfinished request outgrew [`MAX_REQUEST_BYTES`].
    pub fn is_oversized(&self) -> bool {
        self.buf.len() > MAX_REQUEST_BYTES
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Blocking client for the control socket.
pub struct DaemonClient {
    socket: PathBuf,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: i64,
}

impl DaemonClient {
    /// Connect to the daemon serving `dir`.
    pub fn connect(dir: &Path) -> Result<Self, DaemonError> {
        let socket = socket_path(dir);
        let stream = UnixStream::connect(&socket).map_err(|err| {
            if matches!(
                err.kind(),
                ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset
            ) {
                DaemonError::DaemonNotRunning {
                    socket: socket.clone(),
                }
            } else {
                io_err(&socket, err)
            }
        })?;
        stream
            .set_read_timeout(Some(CLIENT_TIMEOUT))
            .and_then(|()| stream.set_write_timeout(Some(CLIENT_TIMEOUT)))
            .map_err(|e| io_err(&socket, e))?;
        let reader = BufReader::new(stream.try_clone().map_err(|e| io_err(&socket, e))?);
        Ok(Self {
            socket,
            writer: stream,
            reader,
            next_id: 1,
        })
    }

    /// Send one request and wait for its response.
    pub fn send(&mut self, request: &Request) -> Result<Response, DaemonError> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        self.writer
            .write_all(&payload)
            .and_then(|()| self.writer.flush())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|e| io_err(&self.socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "daemon closed connection before responding".to_string(),
            ));
        }
        let response: Response = serde_json::from_str(line.trim_end())?;
        if response.id != request.id {
            return Err(DaemonError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id, request.id
            )));
        }
        Ok(response)
    }

    /// Call `method` and return its result, turning an error response into
    /// [`DaemonError::Protocol`].
    pub fn call(&mut self, method: &str, params: Option<Value>) -> Result<Value, DaemonError> {
        let request = Request {
            method: method.to_string(),
            params,
            id: self.next_id,
        };
        self.next_id += 1;
        self.send(&request)?.into_result()
    }
}

pub fn request_ping(dir: &Path) -> Result<Value, DaemonError> {
    DaemonClient::connect(dir)?.call("ping", None)
}

pub fn request_sync(dir: &Path) -> Result<Value, DaemonError> {
    DaemonClient::connect(dir)?.call("sync", None)
}

pub fn request_import(dir: &Path) -> Result<Value, DaemonError> {
    DaemonClient::connect(dir)?.call("import", None)
}

pub fn request_status(dir: &Path) -> Result<Value, DaemonError> {
    DaemonClient::connect(dir)?.call("status", None)
}
