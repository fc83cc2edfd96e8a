//! Stream transport and ring relay tests

use evbuf_shared_memory::{
    RetryPolicy, SharedEventBuffer, ShmError, ShmResult, StreamListener, StreamSocket,
    drain_to_stream, fill_from_stream,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(20);

fn ring(tag: &str) -> ShmResult<SharedEventBuffer> {
    let name = format!("evbuf_relay_{}_{}", tag, std::process::id());
    SharedEventBuffer::open(&name, 1024, true)
}

#[test]
fn test_frames_keep_boundaries() -> ShmResult<()> {
    let listener = StreamListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();

    let client = thread::spawn(move || -> ShmResult<()> {
        let mut socket = StreamSocket::connect(&addr, RetryPolicy::default())?;
        socket.put(b"first")?;
        socket.put(b"")?;
        socket.put_words(&[1, 0xdead_beef])?;
        Ok(())
    });

    let mut server = listener.accept()?;
    let mut buf = Vec::new();
    assert_eq!(server.get(&mut buf)?, 5);
    assert_eq!(buf, b"first");
    assert_eq!(server.get(&mut buf)?, 0);
    assert_eq!(server.get_words()?, vec![1, 0xdead_beef]);

    client.join().unwrap()?;
    assert!(matches!(server.get(&mut buf), Err(ShmError::ConnectionClosed)));
    Ok(())
}

#[test]
fn test_client_retries_until_server_is_up() -> ShmResult<()> {
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0")?;
        probe.local_addr()?
    };

    let client = thread::spawn(move || -> ShmResult<Vec<u32>> {
        let policy = RetryPolicy {
            interval: Duration::from_millis(20),
            max_attempts: 0,
        };
        let mut socket = StreamSocket::connect(&addr.to_string(), policy)?;
        socket.get_words()
    });

    thread::sleep(Duration::from_millis(100));
    let listener = StreamListener::bind(addr)?;
    let mut server = listener.accept()?;
    server.put_words(&[4, 5, 6])?;

    assert_eq!(client.join().unwrap()?, vec![4, 5, 6]);
    Ok(())
}

#[test]
fn test_ring_to_ring_over_tcp() -> ShmResult<()> {
    let source = Arc::new(ring("source")?);
    let sink = Arc::new(ring("sink")?);
    let stop = Arc::new(AtomicBool::new(false));

    let listener = StreamListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();

    let sender = {
        let source = Arc::clone(&source);
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> ShmResult<_> {
            let mut socket = StreamSocket::connect(&addr, RetryPolicy::default())?;
            drain_to_stream(&source, &mut socket, &stop, POLL)
        })
    };
    let receiver = {
        let sink = Arc::clone(&sink);
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> ShmResult<_> {
            let mut socket = listener.accept()?;
            fill_from_stream(&mut socket, &sink, &stop, POLL)
        })
    };

    for i in 1..=100u32 {
        source.write(&vec![i; (i % 5 + 1) as usize], false, None)?;
    }
    for i in 1..=100u32 {
        let (record, _) = sink.read_record(false)?;
        assert_eq!(record, vec![i; (i % 5 + 1) as usize]);
    }

    stop.store(true, Ordering::Relaxed);
    let sent = sender.join().unwrap()?;
    let received = receiver.join().unwrap()?;
    assert_eq!(sent.records, 100);
    assert_eq!(received, sent);

    source.unlink()?;
    sink.unlink()?;
    Ok(())
}
