//! Completion events over the Fluentd forward protocol.
//!
//! Each event is one MessagePack `[tag, time, record]` array written on a
//! short-lived TCP connection.

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Record emitted when a query completes. `elapsed_time_millseconds` keeps
/// its historical spelling for downstream consumers.
#[derive(Debug, Serialize)]
pub struct ExecutedEvent<'a> {
    pub elapsed_time_millseconds: u64,
    pub user: &'a str,
    pub query: &'a str,
    pub query_id: &'a str,
    pub datasource: &'a str,
    pub engine: &'a str,
}

#[derive(Clone, Debug)]
pub struct FluentSink {
    host: String,
    port: u16,
}

impl FluentSink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn emit<T: Serialize>(&self, tag: &str, record: &T) -> io::Result<()> {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let payload = rmp_serde::to_vec_named(&(tag, time, record))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut stream = self.connect()?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        stream.write_all(&payload)?;
        stream.flush()
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}:{}", self.host, self.port),
            )
        }))
    }
}
