//! End-to-end scenario: accept a Unix-domain connection, echo one line
//! back to the client, verify the terminator-bounded read sees exactly
//! what was sent.

use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use loomio::reactor::Reactor;
use loomio::stream::{self, AcceptOutcome, ReadOutcome, WriteOutcome};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn socket_path() -> std::path::PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("loomio-echo-{}-{n}.sock", std::process::id()))
}

#[test]
fn echo_roundtrip_over_unix_socket() {
    let path = socket_path();
    let _ = std::fs::remove_file(&path);
    let listener = stream::local_listen(&path, 16).unwrap();

    let client_path = path.clone();
    let client = thread::spawn(move || -> Vec<u8> {
        let mut h = loop {
            match stream::local_connect(&client_path) {
                Ok(h) => break h,
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        };
        h.write(b"HELLO\n").unwrap();
        h.flush().unwrap();
        loop {
            match h.read(6, Some(b'\n')).unwrap() {
                ReadOutcome::Data(d) if !d.is_empty() => return d,
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
    });

    let reactor = Reactor::new().unwrap();
    reactor.block_on(async {
        let mut server = loop {
            match listener.accept().unwrap() {
                AcceptOutcome::Accepted(h) => break h,
                AcceptOutcome::WouldBlock => {
                    reactor.readable(listener.as_raw_fd()).await.unwrap();
                }
            }
        };

        let request = loop {
            match server.read(4096, None).unwrap() {
                ReadOutcome::Data(d) if !d.is_empty() => break d,
                ReadOutcome::Data(_) => reactor.readable(server.as_raw_fd()).await.unwrap(),
                ReadOutcome::EndOfData => panic!("client closed before sending anything"),
            }
        };

        loop {
            match server.write(&request).unwrap() {
                WriteOutcome::Wrote(_) => break,
                WriteOutcome::WouldBlock => reactor.writable(server.as_raw_fd()).await.unwrap(),
            }
        }
        server.flush().unwrap();
    });

    let echoed = client.join().unwrap();
    assert_eq!(echoed, b"HELLO\n");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn accept_on_fresh_listener_does_not_block() {
    let path = socket_path();
    let _ = std::fs::remove_file(&path);
    let listener = stream::local_listen(&path, 16).unwrap();
    match listener.accept().unwrap() {
        AcceptOutcome::WouldBlock => {}
        AcceptOutcome::Accepted(_) => panic!("unexpected pending connection"),
    }
    let _ = std::fs::remove_file(&path);
}
