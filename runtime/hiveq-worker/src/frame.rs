//! Length-prefixed request/response framing for the stdio front-end.
//!
//! Each frame is a little-endian `u32` byte count followed by a JSON or
//! MessagePack envelope. Responses reuse the codec of their request.

use std::io::{self, Read, Write};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, QueryError};
use crate::executor::QuerySubmission;
use crate::result::QueryResult;
use crate::service::HiveService;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Run and reply with the summary.
    Query,
    /// Queue and reply with the query id.
    Submit,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Request {
    pub request_id: u64,
    pub kind: RequestKind,
    pub datasource: String,
    pub query: String,
    pub user: String,
    #[serde(default)]
    pub store_history: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Response {
    pub request_id: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn status(request_id: u64, status: &str, error: impl ToString) -> Self {
        Self {
            request_id,
            status: status.to_string(),
            query_id: None,
            result: None,
            error: Some(error.to_string()),
        }
    }

    fn submitted(request_id: u64, query_id: String) -> Self {
        Self {
            request_id,
            status: "Ok".to_string(),
            query_id: Some(query_id),
            result: None,
            error: None,
        }
    }

    fn rejected(request_id: u64, err: &DispatchError) -> Self {
        let status = match err {
            DispatchError::QueueFull { .. } => "Busy",
            DispatchError::Closed => "Closed",
        };
        Self::status(request_id, status, err)
    }

    fn finished(request_id: u64, outcome: Result<QueryResult, QueryError>) -> Self {
        match outcome {
            Ok(result) => Self {
                request_id,
                status: "Ok".to_string(),
                query_id: Some(result.query_id.clone()),
                result: Some(result),
                error: None,
            },
            Err(err) => Self {
                request_id,
                status: err.kind().as_str().to_string(),
                query_id: Some(err.query_id),
                result: None,
                error: Some(err.cause.to_string()),
            },
        }
    }
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

pub fn decode_request(bytes: &[u8]) -> Result<(Request, WireCodec), String> {
    if let Ok(request) = rmp_serde::from_slice::<Request>(bytes) {
        return Ok((request, WireCodec::Msgpack));
    }
    serde_json::from_slice::<Request>(bytes)
        .map(|request| (request, WireCodec::Json))
        .map_err(|err| format!("Invalid request: {err}"))
}

pub fn encode_response(response: &Response, wire: WireCodec) -> Result<Vec<u8>, String> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(response).map_err(|err| err.to_string()),
        WireCodec::Json => serde_json::to_vec(response).map_err(|err| err.to_string()),
    }
}

type Outbox = Sender<(WireCodec, Response)>;

/// Reads request frames until EOF and writes one response frame per
/// request. Returns once every queued query has answered.
pub fn serve<R: Read, W: Write + Send>(
    service: &HiveService,
    reader: &mut R,
    writer: W,
) -> io::Result<()> {
    let (outbox, responses) = unbounded::<(WireCodec, Response)>();
    thread::scope(|scope| {
        scope.spawn(move || write_loop(responses, writer));
        let result = read_loop(service, reader, &outbox);
        drop(outbox);
        result
    })
}

fn read_loop<R: Read>(service: &HiveService, reader: &mut R, outbox: &Outbox) -> io::Result<()> {
    loop {
        let frame = match read_frame(reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => {
                let _ = outbox.send((WireCodec::Json, Response::status(0, "InvalidInput", &err)));
                return Err(err);
            }
        };
        match decode_request(&frame) {
            Ok((request, wire)) => handle_request(service, request, wire, outbox),
            Err(err) => {
                let _ = outbox.send((WireCodec::Json, Response::status(0, "InvalidInput", err)));
            }
        }
    }
}

fn handle_request(service: &HiveService, request: Request, wire: WireCodec, outbox: &Outbox) {
    let request_id = request.request_id;
    let response = match request.kind {
        RequestKind::Submit => {
            match service.submit_async(&request.datasource, &request.query, &request.user) {
                Ok(query_id) => Response::submitted(request_id, query_id),
                Err(err) => Response::rejected(request_id, &err),
            }
        }
        RequestKind::Query => {
            let submission = QuerySubmission {
                datasource: request.datasource,
                sql: request.query,
                user: request.user,
                store_history: request.store_history.unwrap_or(true),
                row_limit: request.limit.unwrap_or(service.select_limit()),
            };
            let reply = outbox.clone();
            let queued = service.submit_with(submission, move |outcome| {
                let _ = reply.send((wire, Response::finished(request_id, outcome)));
            });
            match queued {
                Ok(_) => return,
                Err(err) => Response::rejected(request_id, &err),
            }
        }
    };
    let _ = outbox.send((wire, response));
}

fn write_loop<W: Write>(responses: Receiver<(WireCodec, Response)>, mut writer: W) {
    while let Ok((wire, response)) = responses.recv() {
        let encoded = match encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            tracing::error!(error = %err, "failed to write response");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(&mut out, payload).expect("frame");
        out
    }

    #[test]
    fn frames_round_trip_and_eof_is_clean() {
        let mut input = Cursor::new([framed(b"abc"), framed(b"")].concat());
        assert_eq!(read_frame(&mut input).unwrap().as_deref(), Some(&b"abc"[..]));
        assert_eq!(read_frame(&mut input).unwrap().as_deref(), Some(&b""[..]));
        assert!(read_frame(&mut input).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_invalid() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let err = read_frame(&mut Cursor::new(header)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn request_codec_is_detected() {
        let json = br#"{"request_id":7,"kind":"submit","datasource":"dw","query":"select 1","user":"u"}"#;
        let (request, wire) = decode_request(json).expect("json");
        assert_eq!(wire, WireCodec::Json);
        assert_eq!(request.request_id, 7);
        assert_eq!(request.kind, RequestKind::Submit);
        assert!(request.limit.is_none());

        let packed = rmp_serde::to_vec_named(&request).expect("msgpack");
        let (again, wire) = decode_request(&packed).expect("msgpack");
        assert_eq!(wire, WireCodec::Msgpack);
        assert_eq!(again.query, "select 1");

        assert!(decode_request(b"not a request").is_err());
    }

    #[test]
    fn failed_query_reports_kind_as_status() {
        let err = QueryError::new(
            "q1",
            crate::error::ExecError::ConfigMissing("hive.jdbc.dw.url".into()),
        );
        let response = Response::finished(3, Err(err));
        assert_eq!(response.status, "ConfigMissing");
        assert_eq!(response.query_id.as_deref(), Some("q1"));
        let json: serde_json::Value =
            serde_json::from_slice(&encode_response(&response, WireCodec::Json).unwrap()).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"], "missing configuration: hive.jdbc.dw.url");
    }
}
