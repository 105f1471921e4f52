use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::error::FetchError;

pub const DEFAULT_HOST: &str = "ftp.bvbrc.org";
pub const DEFAULT_PORT: u16 = 21;

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASS: &str = "anonymous@";

/// One authenticated control connection in binary mode.
pub trait RemoteSession {
    fn size(&mut self, path: &str) -> Result<u64, FetchError>;

    /// Opens the data connection and issues `RETR`; the returned reader yields
    /// file bytes until the server closes it.
    fn retrieve(&mut self, path: &str) -> Result<Box<dyn Read + Send>, FetchError>;

    fn modified(&mut self, path: &str) -> Result<NaiveDateTime, FetchError>;

    fn quit(&mut self) -> Result<(), FetchError>;
}

pub trait Connector: Send + Sync {
    type Session: RemoteSession;

    fn host(&self) -> &str;

    /// Connects, logs in anonymously and switches to `TYPE I`.
    fn connect(&self) -> Result<Self::Session, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl FtpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }

    fn open_stream(&self) -> Result<TcpStream, FetchError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| FetchError::connection(&self.host, err))?;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => FetchError::connection(&self.host, err),
            None => FetchError::connection(&self.host, "host resolved to no addresses"),
        })
    }
}

impl Default for FtpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT, Duration::from_secs(30))
    }
}

impl Connector for FtpConnector {
    type Session = FtpSession;

    fn host(&self) -> &str {
        &self.host
    }

    fn connect(&self) -> Result<FtpSession, FetchError> {
        let stream = self.open_stream()?;
        let writer = stream
            .try_clone()
            .map_err(|err| FetchError::connection(&self.host, err))?;
        let mut session = FtpSession {
            host: self.host.clone(),
            reader: BufReader::new(stream),
            writer,
            connect_timeout: self.connect_timeout,
            closed: false,
        };

        session.expect_reply(&[220])?;
        let reply = session.command(&format!("USER {ANONYMOUS_USER}"))?;
        match reply.code {
            230 => {}
            331 => {
                session.expect(&format!("PASS {ANONYMOUS_PASS}"), &[230, 202])?;
            }
            code => {
                return Err(FetchError::Protocol {
                    code,
                    message: reply.message,
                });
            }
        }
        session.expect("TYPE I", &[200])?;
        debug!(host = %self.host, "ftp session ready");
        Ok(session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

pub struct FtpSession {
    host: String,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    connect_timeout: Duration,
    closed: bool,
}

impl FtpSession {
    fn read_line(&mut self) -> Result<String, FetchError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|err| FetchError::connection(&self.host, err))?;
        if read == 0 {
            return Err(FetchError::connection(
                &self.host,
                "control connection closed by server",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_reply(&mut self) -> Result<Reply, FetchError> {
        let first = self.read_line()?;
        let (code, multiline, text) = parse_reply_line(&first).ok_or_else(|| {
            FetchError::Protocol {
                code: 0,
                message: format!("malformed reply: {first}"),
            }
        })?;
        let mut message = text.to_string();
        if multiline {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line()?;
                if line.starts_with(&terminator) || line == code.to_string() {
                    message.push('\n');
                    message.push_str(line.get(4..).unwrap_or(""));
                    break;
                }
                message.push('\n');
                message.push_str(&line);
            }
        }
        Ok(Reply { code, message })
    }

    fn command(&mut self, command: &str) -> Result<Reply, FetchError> {
        let logged = if command.starts_with("PASS ") {
            "PASS ****"
        } else {
            command
        };
        debug!(host = %self.host, command = logged, "ftp command");
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .map_err(|err| FetchError::connection(&self.host, err))?;
        self.read_reply()
    }

    fn expect_reply(&mut self, accepted: &[u16]) -> Result<Reply, FetchError> {
        let reply = self.read_reply()?;
        check_reply(reply, accepted)
    }

    fn expect(&mut self, command: &str, accepted: &[u16]) -> Result<Reply, FetchError> {
        let reply = self.command(command)?;
        check_reply(reply, accepted)
    }

    fn passive_address(&mut self) -> Result<SocketAddr, FetchError> {
        let reply = self.expect("PASV", &[227])?;
        let advertised = parse_pasv(&reply.message).ok_or_else(|| FetchError::Protocol {
            code: reply.code,
            message: format!("unparseable PASV reply: {}", reply.message),
        })?;
        // servers behind NAT often advertise a private address; reuse the control peer
        let peer = self
            .writer
            .peer_addr()
            .map(|addr| addr.ip())
            .unwrap_or(advertised.ip());
        Ok(SocketAddr::new(peer, advertised.port()))
    }
}

impl RemoteSession for FtpSession {
    fn size(&mut self, path: &str) -> Result<u64, FetchError> {
        let reply = match self.command(&format!("SIZE {path}")) {
            Ok(reply) => reply,
            Err(FetchError::Protocol { .. }) => {
                return Err(FetchError::SizeUnknown(path.to_string()));
            }
            Err(err) => return Err(err),
        };
        if reply.code != 213 {
            return Err(FetchError::SizeUnknown(path.to_string()));
        }
        reply
            .message
            .trim()
            .parse::<u64>()
            .map_err(|_| FetchError::SizeUnknown(path.to_string()))
    }

    fn retrieve(&mut self, path: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        let addr = self.passive_address()?;
        let data = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|err| FetchError::connection(&self.host, err))?;
        self.expect(&format!("RETR {path}"), &[125, 150])?;
        Ok(Box::new(data))
    }

    fn modified(&mut self, path: &str) -> Result<NaiveDateTime, FetchError> {
        let reply = self.expect(&format!("MDTM {path}"), &[213])?;
        parse_mdtm(&reply.message).ok_or_else(|| FetchError::Protocol {
            code: reply.code,
            message: format!("unparseable MDTM reply: {}", reply.message),
        })
    }

    fn quit(&mut self) -> Result<(), FetchError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer
            .write_all(b"QUIT\r\n")
            .map_err(|err| FetchError::connection(&self.host, err))?;
        // a finished or aborted RETR leaves its 226/426 queued ahead of the 221
        for _ in 0..3 {
            match self.read_reply() {
                Ok(reply) if reply.code == 221 => break,
                Ok(reply) => debug!(code = reply.code, "ftp reply drained before QUIT"),
                Err(err) => {
                    warn!(host = %self.host, error = %err, "ftp QUIT not acknowledged");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn check_reply(reply: Reply, accepted: &[u16]) -> Result<Reply, FetchError> {
    if accepted.contains(&reply.code) {
        Ok(reply)
    } else {
        Err(FetchError::Protocol {
            code: reply.code,
            message: reply.message,
        })
    }
}

/// Splits `"213-text"` / `"213 text"` into code, continuation marker and text.
pub fn parse_reply_line(line: &str) -> Option<(u16, bool, &str)> {
    let code = line.get(..3)?.parse::<u16>().ok()?;
    if !(100..600).contains(&code) {
        return None;
    }
    match line.as_bytes().get(3) {
        None => Some((code, false, "")),
        Some(b'-') => Some((code, true, &line[4..])),
        Some(b' ') => Some((code, false, &line[4..])),
        Some(_) => None,
    }
}

/// Reads the `(h1,h2,h3,h4,p1,p2)` tuple from a `227` reply.
pub fn parse_pasv(message: &str) -> Option<SocketAddr> {
    let open = message.find('(')?;
    let close = message[open..].find(')')? + open;
    let numbers = message[open + 1..close]
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = IpAddr::from([numbers[0], numbers[1], numbers[2], numbers[3]]);
    let port = u16::from(numbers[4]) << 8 | u16::from(numbers[5]);
    Some(SocketAddr::new(ip, port))
}

/// Parses `YYYYMMDDhhmmss[.sss]` from an `MDTM` reply.
pub fn parse_mdtm(message: &str) -> Option<NaiveDateTime> {
    let stamp = message.trim();
    let stamp = stamp.get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()
}
