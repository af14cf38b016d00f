//! End-to-end scenario: spawn `/bin/cat`, round-trip a few bytes through
//! its stdio, and confirm it reaps with a clean exit status.

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use loomio::reactor::Reactor;
use loomio::stream::{ReadOutcome, WriteOutcome};
use loomio::subproc;

#[test]
fn cat_echoes_stdin_to_stdout() {
    let reactor = Reactor::new().unwrap();

    let (collected, exit_status) = reactor.block_on(async {
        let mut child = subproc::execute(&reactor, &["/bin/cat"]).await.unwrap();

        loop {
            match child.stdin.write(b"abc").unwrap() {
                WriteOutcome::Wrote(_) => break,
                WriteOutcome::WouldBlock => {
                    reactor.writable(child.stdin.as_raw_fd()).await.unwrap();
                }
            }
        }
        child.stdin.flush().unwrap();
        child.stdin.shutdown().unwrap();

        let mut collected = Vec::new();
        loop {
            match child.stdout.read(4096, None).unwrap() {
                ReadOutcome::Data(d) if !d.is_empty() => collected.extend(d),
                ReadOutcome::Data(_) => {
                    reactor.readable(child.stdout.as_raw_fd()).await.unwrap();
                }
                ReadOutcome::EndOfData => break,
            }
        }

        let status = loop {
            if let Some(s) = child.wait().unwrap() {
                break s;
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        (collected, status)
    });

    assert_eq!(collected, b"abc");
    assert_eq!(exit_status, 0);
}

#[test]
fn empty_argv_is_rejected() {
    let reactor = Reactor::new().unwrap();
    let empty: [&str; 0] = [];
    let result = reactor.block_on(subproc::execute(&reactor, &empty));
    assert!(result.is_err());
}

#[test]
fn nonexistent_binary_reports_exec_failed() {
    let reactor = Reactor::new().unwrap();
    let result = reactor.block_on(subproc::execute(&reactor, &["/nonexistent/binary/loomio-test"]));
    match result {
        Err(loomio::error::Error::ExecFailed(_)) => {}
        other => panic!("expected ExecFailed, got {other:?}"),
    }
}
