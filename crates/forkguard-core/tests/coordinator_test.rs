#![allow(unsafe_code)]
//! Coordinator behaviour driven through the public API, without a real fork.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

use forkguard_core::{
    CallbackError, ChildPhase, Diagnostic, DiagnosticFormat, ForkCoordinator, ForkGuardConfig,
    MemorySink, Phase, ResourceKind, StreamPair,
};

type Streams = Arc<StreamPair<Vec<u8>, Vec<u8>>>;

fn setup(config: ForkGuardConfig) -> (Arc<ForkCoordinator>, Streams, Arc<MemorySink>) {
    let streams: Streams = Arc::new(StreamPair::new(Vec::new(), Vec::new()));
    let sink = Arc::new(MemorySink::new());
    let coordinator = Arc::new(ForkCoordinator::new(
        Arc::clone(&streams),
        Arc::clone(&sink),
        config,
    ));
    coordinator.install_with(|| Ok(())).unwrap();
    (coordinator, streams, sink)
}

#[test]
fn stream_held_by_another_thread_is_reported_in_parent_only() {
    let (coordinator, streams, sink) = setup(ForkGuardConfig::default());

    let held = Arc::new(Barrier::new(2));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = {
        let streams = Arc::clone(&streams);
        let held = Arc::clone(&held);
        thread::spawn(move || {
            let mut guard = streams.stdout().unwrap().lock();
            guard.extend_from_slice(b"busy");
            held.wait();
            release_rx.recv().unwrap();
        })
    };
    held.wait();

    coordinator.pre_fork().unwrap();
    coordinator.post_fork_parent().unwrap();

    assert!(streams.stdout().unwrap().is_locked());
    assert_eq!(
        sink.lines(),
        vec!["possible deadlock for standard-output\n".to_string()]
    );

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    writeln!(&*streams.stdout().unwrap(), " done").unwrap();
    assert_eq!(streams.stdout().unwrap().lock().as_slice(), b"busy done\n");
}

#[test]
fn child_fixup_lets_callbacks_write_to_the_stream() {
    let (coordinator, streams, sink) = setup(ForkGuardConfig::default());

    let writer = Arc::clone(&streams);
    coordinator
        .on_post_fork_child(move || {
            let stdout = writer
                .stdout()
                .ok_or_else(|| CallbackError::failed("no stdout"))?;
            writeln!(&*stdout, "child says hi").map_err(|e| CallbackError::failed(e.to_string()))
        })
        .unwrap();

    // The owning thread is "gone": its guard was leaked.
    std::mem::forget(streams.stdout().unwrap().lock());

    coordinator.pre_fork().unwrap();
    // SAFETY: no other thread touches the leaked stream lock.
    let child = unsafe { ChildPhase::assume() };
    coordinator.post_fork_child(&child).unwrap();

    assert_eq!(
        streams.stdout().unwrap().lock().as_slice(),
        b"child says hi\n"
    );
    assert!(sink.events().contains(&Diagnostic::DeadlockReleased {
        resource: ResourceKind::StandardOutput
    }));
}

#[test]
fn every_phase_runs_its_own_callbacks_once() {
    let (coordinator, _, sink) = setup(ForkGuardConfig::default());
    let counts: Arc<[AtomicUsize; 3]> = Arc::new(Default::default());
    for (idx, phase) in Phase::ALL.into_iter().enumerate() {
        let counts = Arc::clone(&counts);
        coordinator
            .register(
                phase,
                forkguard_core::fork_callback(move || {
                    counts[idx].fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
    }

    coordinator.pre_fork().unwrap();
    coordinator.post_fork_parent().unwrap();
    let after_parent: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(after_parent, vec![1, 1, 0]);

    coordinator.pre_fork().unwrap();
    // SAFETY: nothing is held; the child sweep finds no locks to release.
    let child = unsafe { ChildPhase::assume() };
    coordinator.post_fork_child(&child).unwrap();
    let after_child: Vec<usize> = counts.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(after_child, vec![2, 1, 1]);
    assert!(sink.is_empty());
}

#[test]
fn registration_blocks_while_state_is_held_for_fork() {
    let (coordinator, _, _) = setup(ForkGuardConfig::default());
    coordinator.pre_fork().unwrap();

    let registered = Arc::new(AtomicUsize::new(0));
    let registrar = {
        let coordinator = Arc::clone(&coordinator);
        let registered = Arc::clone(&registered);
        thread::spawn(move || {
            coordinator.on_post_fork_child(|| Ok(())).unwrap();
            registered.store(1, Ordering::SeqCst);
        })
    };

    thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(registered.load(Ordering::SeqCst), 0);

    coordinator.post_fork_parent().unwrap();
    registrar.join().unwrap();
    assert_eq!(registered.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.callback_count(Phase::PostForkChild), 1);
}

#[test]
fn json_diagnostics_are_one_object_per_line() {
    let config = ForkGuardConfig::default().with_format(DiagnosticFormat::Json);
    let (coordinator, streams, sink) = setup(config);
    coordinator
        .on_pre_fork(|| Err(CallbackError::failed("nope")))
        .unwrap();
    let guard = streams.stderr().unwrap().lock();

    let err = coordinator.pre_fork().unwrap_err();
    coordinator.post_fork_parent().unwrap();
    drop(guard);

    assert_eq!(err, CallbackError::failed("nope"));
    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(lines[0].trim_end()).unwrap();
    assert_eq!(first["event"], "possible_deadlock");
    assert_eq!(first["resource"], "standard-error");
    let second: serde_json::Value = serde_json::from_str(lines[1].trim_end()).unwrap();
    assert_eq!(second["event"], "callback_failed");
    assert_eq!(second["phase"], "pre-fork");
    assert_eq!(second["error"], "nope");
}
