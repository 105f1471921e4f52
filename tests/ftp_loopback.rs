use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use assert_matches::assert_matches;

use bvbrc_fetch::error::FetchError;
use bvbrc_fetch::ftp::{Connector, FtpConnector, RemoteSession};
use bvbrc_fetch::progress::{CancelFlag, NullSink};
use bvbrc_fetch::transfer::{TransferEngine, TransferOutcome, TransferRequest};

/// Minimal FTP server speaking just enough of the protocol for the client.
fn spawn_server(
    files: HashMap<String, Vec<u8>>,
    sessions: usize,
) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut log = Vec::new();
        for _ in 0..sessions {
            let (stream, _) = listener.accept().unwrap();
            serve(stream, &files, &mut log);
        }
        log
    });
    (port, handle)
}

fn serve(stream: TcpStream, files: &HashMap<String, Vec<u8>>, log: &mut Vec<String>) {
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut passive: Option<TcpListener> = None;

    reply(&mut writer, "220-bvbrc test server\r\n220 ready");
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end().to_string();
        log.push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        match verb {
            "USER" => reply(&mut writer, "331 password please"),
            "PASS" => reply(&mut writer, "230 logged in"),
            "TYPE" => reply(&mut writer, "200 binary"),
            "SIZE" => match files.get(arg) {
                Some(data) => reply(&mut writer, &format!("213 {}", data.len())),
                None => reply(&mut writer, "550 no such file"),
            },
            "MDTM" => match files.get(arg) {
                Some(_) => reply(&mut writer, "213 20240131120000"),
                None => reply(&mut writer, "550 no such file"),
            },
            "PASV" => {
                let data = TcpListener::bind("127.0.0.1:0").unwrap();
                let port = data.local_addr().unwrap().port();
                passive = Some(data);
                reply(
                    &mut writer,
                    &format!("227 Entering Passive Mode (127,0,0,1,{},{})", port >> 8, port & 0xff),
                );
            }
            "RETR" => {
                let Some(data_listener) = passive.take() else {
                    reply(&mut writer, "425 use PASV first");
                    continue;
                };
                let Some(data) = files.get(arg) else {
                    reply(&mut writer, "550 no such file");
                    continue;
                };
                reply(&mut writer, "150 opening binary connection");
                let (mut conn, _) = data_listener.accept().unwrap();
                conn.write_all(data).unwrap();
                drop(conn);
                reply(&mut writer, "226 transfer complete");
            }
            "QUIT" => {
                reply(&mut writer, "221 bye");
                return;
            }
            _ => reply(&mut writer, "502 not implemented"),
        }
    }
}

fn reply(writer: &mut TcpStream, text: &str) {
    writer.write_all(format!("{text}\r\n").as_bytes()).unwrap();
}

fn connector(port: u16) -> FtpConnector {
    FtpConnector::new("127.0.0.1", port, Duration::from_secs(5))
}

#[test]
fn downloads_over_passive_connection() {
    let payload: Vec<u8> = (0..5000u32).map(|value| (value % 251) as u8).collect();
    let mut files = HashMap::new();
    files.insert("genomes/562.7587/562.7587.fna".to_string(), payload.clone());
    let (port, server) = spawn_server(files, 1);
    let temp = tempfile::tempdir().unwrap();
    let engine = TransferEngine::new(connector(port));
    let request = TransferRequest::new(
        "genomes/562.7587/562.7587.fna",
        temp.path().join("contigs/562.7587.fna"),
    );

    let outcome = engine.run(&request, &CancelFlag::new(), &NullSink);

    assert_matches!(outcome, TransferOutcome::Completed(5000));
    assert_eq!(std::fs::read(request.destination()).unwrap(), payload);
    let log = server.join().unwrap();
    assert_eq!(
        log,
        vec![
            "USER anonymous",
            "PASS anonymous@",
            "TYPE I",
            "SIZE genomes/562.7587/562.7587.fna",
            "PASV",
            "RETR genomes/562.7587/562.7587.fna",
            "QUIT",
        ]
    );
}

#[test]
fn unknown_file_has_no_size() {
    let (port, server) = spawn_server(HashMap::new(), 1);
    let temp = tempfile::tempdir().unwrap();
    let engine = TransferEngine::new(connector(port));
    let request = TransferRequest::new("missing.txt", temp.path().join("missing.txt"));

    let outcome = engine.run(&request, &CancelFlag::new(), &NullSink);

    assert_matches!(
        outcome,
        TransferOutcome::Failed(FetchError::SizeUnknown(path)) if path == "missing.txt"
    );
    assert!(!request.destination().exists());
    let log = server.join().unwrap();
    assert_eq!(log.last().map(String::as_str), Some("QUIT"));
}

#[test]
fn session_reports_modification_time() {
    let mut files = HashMap::new();
    files.insert("RELEASE_NOTES/genome_metadata".to_string(), vec![b'x'; 10]);
    let (port, server) = spawn_server(files, 1);

    let mut session = connector(port).connect().unwrap();
    let modified = session.modified("RELEASE_NOTES/genome_metadata").unwrap();
    assert_eq!(session.size("RELEASE_NOTES/genome_metadata").unwrap(), 10);
    session.quit().unwrap();

    assert_eq!(modified.format("%Y%m%d%H%M%S").to_string(), "20240131120000");
    server.join().unwrap();
}

#[test]
fn refused_connection_is_a_connection_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let error = connector(port).connect().err();
    assert_matches!(error, Some(FetchError::Connection { .. }));
}
