//! End-to-end scheduler tests.

use crate::op::Op;
use crate::op::single::ReadOp;
use crate::runtime::Builder;
use crate::{self as vortio, net::Socket, time};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use std::future::Future;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

#[test]
fn test_block_on_returns_root_output() {
    let runtime = Builder::new().num_workers(1).try_build().unwrap();
    assert_eq!(runtime.block_on(async { 40 + 2 }), 42);
}

#[test]
fn test_block_on_reusable_and_runtime_rebuildable() {
    let runtime = Builder::new().num_workers(1).try_build().unwrap();
    assert_eq!(runtime.block_on(async { 1 }), 1);
    assert_eq!(runtime.block_on(async { 2 }), 2);
    drop(runtime);

    // The thread can host a fresh runtime once the previous one is gone.
    let runtime = Builder::new().num_workers(1).try_build().unwrap();
    assert_eq!(runtime.block_on(async { 3 }), 3);
}

#[test]
fn test_nested_runtime_on_same_thread_is_refused() {
    let _runtime = Builder::new().num_workers(1).try_build().unwrap();
    assert!(Builder::new().num_workers(1).try_build().is_err());
}

#[vortio::test]
async fn test_spawn_and_join() {
    let handle = vortio::spawn(async { 6 * 7 });
    assert_eq!(handle.await.unwrap(), 42);
}

#[vortio::test]
async fn test_join_handles_resolve_in_any_order() {
    let handles: Vec<_> = (0..64).map(|i| vortio::spawn(async move { i })).collect();
    let mut total = 0;
    for handle in handles.into_iter().rev() {
        total += handle.await.unwrap();
    }
    assert_eq!(total, (0..64).sum());
}

#[vortio::test]
async fn test_echo_over_socketpair() {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let ours = Socket::from_owned(ours);
    let theirs = Socket::from_owned(theirs);

    let writer = vortio::spawn(async move {
        theirs.send(b"hello").await.expect("send failed");
        theirs
    });

    let mut buf = [0u8; 5];
    let received = ours.recv(&mut buf).await.expect("recv failed");
    assert_eq!(received, 5);
    assert_eq!(&buf, b"hello");

    writer.await.unwrap();
}

#[vortio::test(worker_threads = 2)]
async fn test_fan_out_pipe_reads() {
    const TASKS: usize = 100;

    let mut write_ends = Vec::with_capacity(TASKS);
    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let (read_end, write_end) = nix::unistd::pipe().unwrap();
            write_ends.push(write_end);
            vortio::spawn(async move {
                let owned: OwnedFd = read_end;
                let mut byte = [0u8; 1];
                Op::new(ReadOp::new(owned.as_raw_fd(), &mut byte, 0)).await
            })
        })
        .collect();

    for write_end in &write_ends {
        nix::unistd::write(write_end, b"x").unwrap();
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }
}

#[test]
fn test_work_spreads_across_workers() {
    let runtime = Builder::new().num_workers(4).try_build().unwrap();
    let total: usize = runtime.block_on(async {
        let handles: Vec<_> = (0..300)
            .map(|_| {
                vortio::spawn(async {
                    time::sleep(Duration::from_millis(10)).await.unwrap();
                    1usize
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        total
    });
    assert_eq!(total, 300);
}

#[vortio::test]
async fn test_cancel_resolves_promptly() {
    let handle = vortio::spawn(async {
        time::sleep(Duration::from_secs(60)).await.unwrap();
    });

    time::sleep(Duration::from_millis(10)).await.unwrap();

    let start = Instant::now();
    handle.cancel();
    let err = handle.await.expect_err("cancelled task must not succeed");
    assert!(err.is_cancelled());
    // The in-flight timer was cancelled, not waited out.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[vortio::test]
async fn test_cancel_after_completion_is_a_noop() {
    let handle = vortio::spawn(async { 5 });
    time::sleep(Duration::from_millis(5)).await.unwrap();
    handle.cancel();
    assert_eq!(handle.await.unwrap(), 5);
}

#[vortio::test]
async fn test_task_panic_poisons_only_itself() {
    let bad = vortio::spawn(async {
        panic!("boom");
    });
    let err = bad.await.expect_err("panicked task must not succeed");
    assert!(err.is_panic());
    assert_eq!(*err.into_panic().downcast::<&str>().unwrap(), "boom");

    // The worker that caught the panic keeps scheduling.
    let good = vortio::spawn(async { 11 });
    assert_eq!(good.await.unwrap(), 11);
}

#[test]
fn test_shutdown_resolves_every_handle() {
    let runtime = Builder::new().num_workers(2).try_build().unwrap();

    let handles = runtime.block_on(async {
        let handles: Vec<_> = (0..50)
            .map(|i| {
                vortio::spawn(async move {
                    if i % 2 == 0 {
                        time::sleep(Duration::from_secs(10)).await.unwrap();
                    }
                    i
                })
            })
            .collect();

        // Let the sleepers reach their suspension points.
        time::sleep(Duration::from_millis(50)).await.unwrap();
        handles
    });

    let start = Instant::now();
    runtime.shutdown();
    assert!(start.elapsed() < Duration::from_secs(5));

    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    for handle in handles {
        assert!(handle.is_finished(), "handle left unresolved by shutdown");
        match pin!(handle).poll(&mut cx) {
            // Fast tasks completed; sleepers were cancelled.
            Poll::Ready(Ok(i)) => assert_eq!(i % 2, 1),
            Poll::Ready(Err(err)) => assert!(err.is_cancelled()),
            Poll::Pending => panic!("finished handle returned Pending"),
        }
    }
}

#[test]
fn test_spawn_after_shutdown_is_refused() {
    let runtime = Builder::new().num_workers(1).try_build().unwrap();
    runtime.shutdown();

    let handle = runtime.spawn(async { 1 });
    assert!(handle.is_finished());

    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    match pin!(handle).poll(&mut cx) {
        Poll::Ready(Err(err)) => assert!(err.is_shutdown()),
        other => panic!("expected shutdown error, got {other:?}"),
    }
}

#[test]
fn test_spawn_from_foreign_thread_lands_globally() {
    let runtime = Builder::new().num_workers(2).try_build().unwrap();

    let handle = std::thread::scope(|scope| {
        scope
            .spawn(|| runtime.spawn(async { 123 }))
            .join()
            .unwrap()
    });

    assert_eq!(runtime.block_on(async move { handle.await.unwrap() }), 123);
}
