//! End-to-end scenario: once the peer has fully closed its end, a bulk
//! write eventually surfaces `Error::PeerClosed` instead of killing the
//! process with `SIGPIPE` or hanging.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use loomio::error::Error;
use loomio::stream::{self, AcceptOutcome, Handle};

static COUNTER: AtomicU32 = AtomicU32::new(0);

fn connected_pair() -> (Handle, Handle) {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("loomio-pair-{}-{n}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let listener = stream::local_listen(&path, 1).unwrap();
    let client = stream::local_connect(&path).unwrap();
    let server = loop {
        match listener.accept().unwrap() {
            AcceptOutcome::Accepted(h) => break h,
            AcceptOutcome::WouldBlock => std::thread::sleep(Duration::from_millis(2)),
        }
    };
    let _ = std::fs::remove_file(&path);
    (client, server)
}

#[test]
fn write_after_peer_closes_returns_peer_closed() {
    let (mut a, b) = connected_pair();
    drop(b);

    let chunk = vec![0xABu8; 1 << 16];
    let outcome = (|| -> Result<(), Error> {
        for _ in 0..256 {
            a.write(&chunk)?;
            a.flush()?;
        }
        Ok(())
    })();

    match outcome {
        Err(Error::PeerClosed) => {}
        other => panic!("expected PeerClosed, got {other:?}"),
    }

    // A subsequent shutdown still completes (idempotent close semantics;
    // a broken peer does not leave the handle permanently unusable for
    // teardown).
    a.shutdown().unwrap();
}
