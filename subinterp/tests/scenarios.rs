//! End-to-end exercises of the worker and queue surface across real OS
//! threads standing in for interpreters (spec §8's concrete scenarios).

use std::sync::Arc;
use std::time::Duration;

use subinterp::{HostRuntime, InterpreterWorker, Queue, SubinterpError, ThreadHost};

fn cos_small_angle(x: f64) -> f64 {
    1.0 - x * x / 2.0
}

/// A worker call for `cos(0)` must come back as `1.0`, round-tripped through
/// the shared command/return buffer rather than computed locally.
#[test]
fn worker_call_returns_cos_of_zero() -> anyhow::Result<()> {
    let host = Arc::new(ThreadHost::new());
    let worker = InterpreterWorker::start(host)?;
    let result = worker.run(cos_small_angle, 0.0f64)?;
    assert_eq!(result, 1.0);
    worker.close()?;
    Ok(())
}

/// A value put from the "parent" (this test's main thread, `MAIN_INTERPRETER`)
/// is visible to a "child" thread that attaches the same queue handle.
#[test]
fn queue_moves_a_value_from_parent_to_a_child_thread() -> anyhow::Result<()> {
    let host = Arc::new(ThreadHost::new());
    let mut queue = Queue::create(host.clone(), 0)?;
    queue.put(&vec![1u8, 2, 3], true, None)?;

    let handle = queue.handle()?;
    let child_host = host.clone();
    let got: Vec<u8> = std::thread::spawn(move || -> anyhow::Result<Vec<u8>> {
        // SAFETY: `queue` (below) is not dropped until this thread joins.
        let child_queue = unsafe { Queue::attach(child_host, handle)? };
        let value: Vec<u8> = child_queue.get(true, Some(Duration::from_millis(500)))?;
        Ok(value)
    })
    .join()
    .unwrap()?;

    assert_eq!(got, vec![1, 2, 3]);
    queue.close()?;
    Ok(())
}

/// A child interpreter posts a value and then dies before the parent reads
/// it; the parent's `get` must treat that item as gone (not a hang, not a
/// stale read) rather than return it.
#[test]
fn queue_get_skips_an_item_from_a_child_that_died() -> anyhow::Result<()> {
    let host = Arc::new(ThreadHost::new());
    let mut queue = Queue::create(host.clone(), 0)?;
    let handle = queue.handle()?;

    // Run the post *on the child's own worker thread* via `run_command`, so
    // `current_interpreter()` inside the closure reports the child's handle
    // (set by `ThreadHost::create_interpreter`) and the posted slot is
    // genuinely owned by it, not by whichever thread happened to call `put`.
    let child = host.create_interpreter()?;
    let child_host = host.clone();
    host.run_command(
        child,
        Box::new(move || {
            // SAFETY: `queue` (below) is not dropped until after `destroy_interpreter`.
            let attached = unsafe { Queue::attach(child_host, handle) }.map_err(|e| e.to_string())?;
            attached.put(&99i32, true, None).map_err(|e| e.to_string())?;
            Ok(Vec::new())
        }),
    )?;

    host.destroy_interpreter(child)?;

    let result: Result<i32, SubinterpError> = queue.get(false, None);
    assert!(matches!(result, Err(SubinterpError::Empty)));

    queue.close()?;
    Ok(())
}

/// A bounded queue's `put_nowait` must fail `Full` once `maxsize` is reached,
/// and succeed again after a `get` frees a slot.
#[test]
fn bounded_queue_rejects_puts_past_maxsize() -> anyhow::Result<()> {
    let host = Arc::new(ThreadHost::new());
    let queue = Queue::create(host, 1)?;
    queue.put_nowait(&1i32)?;
    assert!(matches!(queue.put_nowait(&2i32), Err(SubinterpError::Full)));

    let _: i32 = queue.get_nowait()?;
    queue.put_nowait(&3i32)?;
    queue.close()?;
    Ok(())
}
