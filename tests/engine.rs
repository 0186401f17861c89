//! End-to-end tests driving two engines over a Unix socket pair, one
//! playing each host.

use std::{
    os::unix::net::UnixStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Context;
use netpipefs::{socket::Transport, Engine, Error, OpenMode, PollHandle};

type TestResult = anyhow::Result<()>;

/// Generous pause for in-flight frames to be dispatched on the other side.
fn settle() {
    thread::sleep(Duration::from_millis(200));
}

/// Builds two connected engines. The handshake is symmetric, so the two
/// sides have to run concurrently.
fn engine_pair(
    readahead_a: usize,
    writeahead_a: usize,
    readahead_b: usize,
    writeahead_b: usize,
) -> anyhow::Result<(Arc<Engine>, Arc<Engine>)> {
    let (stream_a, stream_b) = UnixStream::pair().context("socketpair failed")?;
    let side_b =
        thread::spawn(move || Engine::start(Transport::Unix(stream_b), readahead_b, writeahead_b));
    let a = Engine::start(Transport::Unix(stream_a), readahead_a, writeahead_a)
        .context("engine A failed to start")?;
    let b = side_b
        .join()
        .unwrap()
        .context("engine B failed to start")?;
    Ok((Arc::new(a), Arc::new(b)))
}

/// Opens `path` for writing on `writer` and reading on `reader`, waiting
/// for the pairing to complete on both sides.
fn open_pair(writer: &Arc<Engine>, reader: &Arc<Engine>, path: &str) -> TestResult {
    let writer = writer.clone();
    let wpath = path.to_owned();
    let opening = thread::spawn(move || writer.open(&wpath, OpenMode::Write, false));
    reader
        .open(path, OpenMode::Read, false)
        .context("reader open failed")?;
    opening
        .join()
        .unwrap()
        .context("writer open failed")?;
    Ok(())
}

#[test]
fn smallest_round_trip() -> TestResult {
    let (a, b) = engine_pair(4096, 4096, 4096, 4096)?;
    open_pair(&a, &b, "/x")?;

    let sent = a.write("/x", b"hello", false).context("write failed")?;
    assert_eq!(sent, 5);

    let mut buf = [0; 5];
    let got = b.read("/x", &mut buf, false).context("read failed")?;
    assert_eq!(got, 5);
    assert_eq!(&buf, b"hello");

    b.close("/x", OpenMode::Read).context("reader close failed")?;
    settle();
    a.close("/x", OpenMode::Write).context("writer close failed")?;
    settle();

    assert_eq!(a.open_pipes(), 0, "registry on A should be empty");
    assert_eq!(b.open_pipes(), 0, "registry on B should be empty");
    Ok(())
}

#[test]
fn writeahead_masks_missing_credit() -> TestResult {
    // B declares no readahead, so A starts with zero credit and the write
    // can only be absorbed by A's writeahead ring.
    let (a, b) = engine_pair(0, 64, 0, 0)?;
    open_pair(&a, &b, "/w")?;

    let payload: Vec<u8> = (0..32u8).collect();
    let sent = a.write("/w", &payload, false).context("write failed")?;
    assert_eq!(sent, 32, "the whole write must land in the writeahead ring");

    let mut buf = [0; 32];
    let got = b.read("/w", &mut buf, false).context("read failed")?;
    assert_eq!(got, 32);
    assert_eq!(&buf[..], &payload[..]);

    b.close("/w", OpenMode::Read)?;
    settle();
    a.close("/w", OpenMode::Write)?;
    Ok(())
}

#[test]
fn credit_backpressure() -> TestResult {
    // B grants 16 bytes of credit; A has no writeahead. A blocking write of
    // 40 bytes may only complete once B has consumed enough for the last
    // byte to leave.
    let (a, b) = engine_pair(16, 0, 16, 0)?;
    open_pair(&a, &b, "/bp")?;

    let payload: Vec<u8> = (0..40u8).collect();
    let writer = {
        let a = a.clone();
        let payload = payload.clone();
        thread::spawn(move || a.write("/bp", &payload, false))
    };
    settle();
    assert!(!writer.is_finished(), "write must block behind the window");

    let mut got = Vec::new();
    let mut chunk = [0; 8];
    for reads in 1..=5 {
        let n = b.read("/bp", &mut chunk, false).context("read failed")?;
        assert_eq!(n, 8);
        got.extend_from_slice(&chunk);
        settle();
        if reads == 2 {
            // 16 bytes consumed: not enough for the remaining 24 to clear.
            assert!(!writer.is_finished(), "write completed too early");
        }
    }
    assert_eq!(writer.join().unwrap().context("write failed")?, 40);
    assert_eq!(got, payload);

    b.close("/bp", OpenMode::Read)?;
    settle();
    a.close("/bp", OpenMode::Write)?;
    Ok(())
}

#[test]
fn broken_pipe_on_reader_exit() -> TestResult {
    let (a, b) = engine_pair(16, 0, 16, 0)?;
    open_pair(&a, &b, "/d")?;

    b.close("/d", OpenMode::Read).context("reader close failed")?;
    settle();

    match a.write("/d", b"doomed", false) {
        Err(Error::BrokenPipe) => {}
        other => panic!("expected broken pipe, got {other:?}"),
    }
    let readiness = a.poll("/d", None).context("poll failed")?;
    assert!(readiness.error(), "a writer without readers polls as error");

    a.close("/d", OpenMode::Write)?;
    Ok(())
}

/// Poll handle that records whether it was fired.
struct Flag(Arc<AtomicBool>);

impl PollHandle for Flag {
    fn notify(self: Box<Self>) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn poll_readiness_tracks_pipe_state() -> TestResult {
    let (a, b) = engine_pair(16, 16, 16, 16)?;
    open_pair(&a, &b, "/p")?;

    assert!(a.poll("/p", None)?.writable(), "credit means writable");
    assert!(b.poll("/p", None)?.readable(), "a live writer means readable");

    // A parked handle must fire when data arrives.
    let fired = Arc::new(AtomicBool::new(false));
    b.poll("/p", Some(Box::new(Flag(fired.clone()))))?;
    a.write("/p", b"ping", false)?;
    settle();
    assert!(fired.load(Ordering::SeqCst), "incoming data must notify pollers");

    let mut buf = [0; 4];
    assert_eq!(b.read("/p", &mut buf, false)?, 4);

    a.close("/p", OpenMode::Write)?;
    settle();
    let readiness = b.poll("/p", None)?;
    assert!(
        readiness.hangup(),
        "no writers and an empty ring polls as hangup"
    );
    b.close("/p", OpenMode::Read)?;
    Ok(())
}

#[test]
fn eof_on_writer_exit() -> TestResult {
    let (a, b) = engine_pair(16, 16, 16, 16)?;
    open_pair(&a, &b, "/e")?;

    assert_eq!(a.write("/e", b"abc", false)?, 3);
    a.close("/e", OpenMode::Write).context("writer close failed")?;
    settle();

    let mut buf = [0; 16];
    let got = b.read("/e", &mut buf, false).context("read failed")?;
    assert_eq!(got, 3);
    assert_eq!(&buf[..3], b"abc");

    let got = b.read("/e", &mut buf, false).context("read at EOF failed")?;
    assert_eq!(got, 0, "a drained pipe with no writers reads as EOF");

    b.close("/e", OpenMode::Read)?;
    Ok(())
}

#[test]
fn role_conflict_on_second_local_mode() -> TestResult {
    let (a, b) = engine_pair(16, 16, 16, 16)?;

    let opening = {
        let a = a.clone();
        thread::spawn(move || a.open("/y", OpenMode::Write, false))
    };
    settle();

    // The same host cannot take the opposite role, even while the first
    // open is still waiting for its pairing.
    match a.open("/y", OpenMode::Read, true) {
        Err(Error::RoleConflict) => {}
        other => panic!("expected a role conflict, got {other:?}"),
    }

    b.open("/y", OpenMode::Read, false).context("reader open failed")?;
    opening.join().unwrap().context("writer open failed")?;

    // More writers on the same host are fine.
    a.open("/y", OpenMode::Write, true)
        .context("second writer open failed")?;

    b.close("/y", OpenMode::Read)?;
    settle();
    while a.close("/y", OpenMode::Write).is_ok() {}
    Ok(())
}

#[test]
fn nonblocking_open_fails_without_peer() -> TestResult {
    let (a, _b) = engine_pair(16, 16, 16, 16)?;
    match a.open("/alone", OpenMode::Write, true) {
        Err(Error::WouldBlock) => {}
        other => panic!("expected would-block, got {other:?}"),
    }
    assert_eq!(a.open_pipes(), 0, "a failed nonblocking open must not linger");
    Ok(())
}

#[test]
fn blocking_open_waits_for_pairing() -> TestResult {
    let (a, b) = engine_pair(16, 16, 16, 16)?;

    let opening = {
        let a = a.clone();
        thread::spawn(move || a.open("/pair", OpenMode::Write, false))
    };
    settle();
    assert!(
        !opening.is_finished(),
        "open must not return before the peer shows up"
    );

    b.open("/pair", OpenMode::Read, false).context("reader open failed")?;
    opening.join().unwrap().context("writer open failed")?;

    b.close("/pair", OpenMode::Read)?;
    settle();
    a.close("/pair", OpenMode::Write)?;
    Ok(())
}

#[test]
fn byte_stream_fidelity_across_chunked_transfers() -> TestResult {
    const TOTAL: usize = 32 * 1024;
    let (a, b) = engine_pair(1024, 512, 1024, 512)?;
    open_pair(&a, &b, "/fidelity")?;

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let writer = {
        let a = a.clone();
        let payload = payload.clone();
        thread::spawn(move || -> TestResult {
            // Deterministically ragged chunk sizes.
            let mut sent = 0;
            let mut lcg: u64 = 0xdeadbeef;
            while sent < payload.len() {
                lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1);
                let chunk = 1 + (lcg >> 33) as usize % 1500;
                let end = (sent + chunk).min(payload.len());
                let n = a
                    .write("/fidelity", &payload[sent..end], false)
                    .context("chunk write failed")?;
                sent += n;
            }
            a.close("/fidelity", OpenMode::Write).context("writer close failed")?;
            Ok(())
        })
    };

    let mut got = Vec::with_capacity(TOTAL);
    let mut lcg: u64 = 0xfeedface;
    while got.len() < TOTAL {
        lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1);
        let chunk = 1 + (lcg >> 33) as usize % 997;
        let mut buf = vec![0; chunk];
        let n = b
            .read("/fidelity", &mut buf, false)
            .context("chunk read failed")?;
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap()?;

    assert_eq!(got.len(), TOTAL);
    assert_eq!(got, payload, "reader must observe the written bytes in order");

    b.close("/fidelity", OpenMode::Read)?;
    Ok(())
}

#[test]
fn shutdown_unblocks_every_waiter() -> TestResult {
    // Zero credit and zero writeahead: the writer below cannot make any
    // progress, and the reader has nothing to read.
    let (a, b) = engine_pair(0, 0, 0, 0)?;
    open_pair(&a, &b, "/wblock")?;
    open_pair(&b, &a, "/rblock")?;

    let blocked_writer = {
        let a = a.clone();
        thread::spawn(move || a.write("/wblock", b"stuck", false))
    };
    let blocked_reader = {
        let a = a.clone();
        thread::spawn(move || {
            let mut buf = [0; 8];
            a.read("/rblock", &mut buf, false)
        })
    };
    settle();
    assert!(!blocked_writer.is_finished());
    assert!(!blocked_reader.is_finished());

    a.shutdown();

    match blocked_writer.join().unwrap() {
        Err(Error::BrokenPipe) => {}
        other => panic!("expected the blocked write to fail, got {other:?}"),
    }
    assert!(
        blocked_reader.join().unwrap().is_err(),
        "the blocked read must fail after shutdown"
    );

    // The severed socket tears the peer down as well.
    settle();
    match b.write("/rblock", b"x", false) {
        Err(Error::BrokenPipe) => {}
        other => panic!("expected broken pipe on the peer, got {other:?}"),
    }
    Ok(())
}

#[test]
fn reopen_after_full_close() -> TestResult {
    let (a, b) = engine_pair(16, 16, 16, 16)?;

    for round in 0..2u8 {
        open_pair(&a, &b, "/again")?;
        let payload = [round; 7];
        assert_eq!(a.write("/again", &payload, false)?, 7);
        let mut buf = [0; 7];
        assert_eq!(b.read("/again", &mut buf, false)?, 7);
        assert_eq!(buf, payload);
        b.close("/again", OpenMode::Read)?;
        settle();
        a.close("/again", OpenMode::Write)?;
        settle();
        assert_eq!(a.open_pipes(), 0);
        assert_eq!(b.open_pipes(), 0);
    }
    Ok(())
}
