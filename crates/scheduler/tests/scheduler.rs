use std::{
    io::IsTerminal,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use scheduler::{
    Binding, CommandError, CommandScheduler, FnCommand, Priority, Reentry, WorkerPool,
};
use tracing_subscriber::EnvFilter;

const TIMEOUT: Duration = Duration::from_secs(5);

// test suite "constructor"
#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

fn scheduler(name: &str) -> eyre::Result<(WorkerPool, CommandScheduler)> {
    let pool = WorkerPool::new(4)?;
    let scheduler = CommandScheduler::new(name, pool.handle());
    Ok((pool, scheduler))
}

/// Command that reports `label` on `tx` when it runs
fn record(priority: Priority, label: &'static str, tx: &Sender<&'static str>) -> FnCommand {
    let tx = tx.clone();
    FnCommand::new(priority, label, move |_| {
        let _ = tx.send(label);
        Ok(())
    })
}

/// Command that blocks its worker until `gate` is dropped, reporting once it started
fn blocker(started: &Sender<&'static str>, gate: Receiver<()>) -> FnCommand {
    let started = started.clone();
    FnCommand::new(Priority::Normal, "blocker", move |_| {
        let _ = started.send("blocked");
        let _ = gate.recv();
        Ok(())
    })
}

fn next(rx: &Receiver<&'static str>) -> &'static str {
    match rx.recv_timeout(TIMEOUT) {
        Ok(label) => label,
        Err(RecvTimeoutError::Timeout) => panic!("timeout waiting for command"),
        Err(RecvTimeoutError::Disconnected) => panic!("recorder disconnected"),
    }
}

#[derive(Debug)]
struct Flag(AtomicBool);

impl Binding for Flag {
    fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn commands_run_in_priority_order() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("ordering")?;
    let (tx, rx) = crossbeam_channel::unbounded();

    assert!(scheduler.schedule(record(Priority::Low, "low", &tx)));
    assert!(scheduler.schedule(record(Priority::Normal, "n1", &tx)));
    assert!(scheduler.schedule(record(Priority::High, "high", &tx)));
    assert!(scheduler.schedule(record(Priority::Normal, "n2", &tx)));
    assert!(scheduler.push_back(record(Priority::Normal, "front", &tx)));
    scheduler.start();

    let order: Vec<_> = (0..5).map(|_| next(&rx)).collect();
    assert_eq!(order, vec!["high", "front", "n1", "n2", "low"]);
    Ok(())
}

#[test]
fn failing_and_panicking_commands_do_not_stop_the_worker() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("failures")?;
    let (tx, rx) = crossbeam_channel::unbounded();

    let finished = tx.clone();
    scheduler.schedule(
        FnCommand::new(Priority::Normal, "fails", |_| {
            Err(CommandError::Failed(eyre::eyre!("target rejected request")))
        })
        .with_finished(move || {
            let _ = finished.send("fails finished");
        }),
    );
    let finished = tx.clone();
    scheduler.schedule(
        FnCommand::new(Priority::Normal, "panics", |_| panic!("bad command"))
            .with_finished(move || {
                let _ = finished.send("panics finished");
            }),
    );
    let finished = tx.clone();
    scheduler.schedule(
        FnCommand::new(Priority::Normal, "cancelled", |_| Err(CommandError::Cancelled))
            .with_finished(move || {
                let _ = finished.send("cancelled finished");
            }),
    );
    scheduler.schedule(record(Priority::Normal, "survivor", &tx));
    scheduler.start();

    assert_eq!(next(&rx), "fails finished");
    assert_eq!(next(&rx), "panics finished");
    assert_eq!(next(&rx), "cancelled finished");
    assert_eq!(next(&rx), "survivor");
    assert!(!scheduler.is_closed());
    Ok(())
}

#[test]
fn disconnect_closes_the_queue_and_cancels_the_rest() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("disconnect")?;
    let (tx, rx) = crossbeam_channel::unbounded();

    scheduler.schedule(FnCommand::new(Priority::High, "disconnects", |_| {
        Err(CommandError::Disconnected)
    }));
    for label in ["a", "b", "c"] {
        let cancelled = tx.clone();
        scheduler.schedule(record(Priority::Normal, label, &tx).with_cancel(move || {
            let _ = cancelled.send("cancelled");
        }));
    }
    let request = scheduler.start();

    assert!(request.wait_for(TIMEOUT), "worker did not exit");
    assert!(scheduler.is_closed());
    for _ in 0..3 {
        assert_eq!(next(&rx), "cancelled");
    }
    assert!(rx.try_recv().is_err(), "a command ran or was cancelled twice");
    assert_eq!(scheduler.queued(), 0);
    Ok(())
}

#[test]
fn schedule_after_close_is_rejected() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("closed")?;
    let (tx, rx) = crossbeam_channel::unbounded();

    assert!(scheduler.schedule(record(Priority::Normal, "queued", &tx)));
    scheduler.close();

    let cancelled = tx.clone();
    let accepted = scheduler.schedule(record(Priority::High, "late", &tx).with_cancel(move || {
        let _ = cancelled.send("late cancelled");
    }));
    assert!(!accepted);
    assert_eq!(scheduler.queued(), 1);
    assert_eq!(next(&rx), "late cancelled");
    Ok(())
}

#[test]
fn close_stops_an_idle_worker_and_drains() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("idle")?;
    let request = scheduler.start();
    assert!(!request.wait_for(Duration::from_millis(50)));

    scheduler.close();
    assert!(request.wait_for(TIMEOUT));
    assert!(request.is_finished());
    Ok(())
}

#[test]
fn switch_to_request_bypasses_a_stuck_worker() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("switch")?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

    let old = scheduler.start();
    scheduler.schedule(blocker(&tx, gate_rx));
    assert_eq!(next(&rx), "blocked");

    scheduler.schedule(record(Priority::Normal, "after switch", &tx));
    let new = scheduler.switch_to_request();
    assert_ne!(old.id(), new.id());
    assert!(old.is_stop_requested());

    assert_eq!(next(&rx), "after switch");

    // unblocking the old worker lets it exit without touching the queue
    drop(gate_tx);
    assert!(old.wait_for(TIMEOUT));
    assert!(!new.is_finished());
    assert_eq!(
        scheduler.current_request().map(|r| r.id()),
        Some(new.id())
    );
    Ok(())
}

#[test]
fn invoke_and_wait_returns_after_the_command_ran() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("invoke")?;
    scheduler.start();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let completed = scheduler.invoke_and_wait(FnCommand::new(Priority::Normal, "set", move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }));
    assert!(completed);
    assert!(ran.load(Ordering::SeqCst));

    scheduler.close();
    let completed =
        scheduler.invoke_and_wait(FnCommand::new(Priority::Normal, "too late", |_| Ok(())));
    assert!(!completed);
    Ok(())
}

#[test]
fn invoke_and_wait_on_the_worker_runs_inline() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("inline")?;
    let (tx, rx) = crossbeam_channel::unbounded();
    scheduler.start();

    let inner = tx.clone();
    scheduler.schedule(FnCommand::new(Priority::Normal, "outer", move |cx| {
        let nested = record(Priority::Low, "nested", &inner);
        let completed = cx.scheduler().invoke_and_wait(nested);
        let _ = inner.send(if completed { "outer done" } else { "outer failed" });
        Ok(())
    }));

    assert_eq!(next(&rx), "nested");
    assert_eq!(next(&rx), "outer done");
    Ok(())
}

#[test]
fn terminate_and_invoke_runs_despite_a_stuck_worker() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("terminate")?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let (_gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

    let stuck = scheduler.start();
    scheduler.schedule(blocker(&tx, gate_rx));
    assert_eq!(next(&rx), "blocked");

    assert!(scheduler.terminate_and_invoke(
        record(Priority::High, "detached", &tx),
        Duration::from_millis(100),
    ));

    assert_eq!(next(&rx), "detached");
    assert!(stuck.is_stop_requested());
    Ok(())
}

#[test]
fn terminate_and_invoke_leaves_a_healthy_worker_alone() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("healthy")?;
    let (tx, rx) = crossbeam_channel::unbounded();

    let worker = scheduler.start();
    assert!(scheduler.terminate_and_invoke(
        record(Priority::High, "detached", &tx),
        Duration::from_millis(100),
    ));
    assert_eq!(next(&rx), "detached");

    thread::sleep(Duration::from_millis(300));
    assert!(!worker.is_stop_requested());
    Ok(())
}

#[test]
fn reentry_from_a_foreign_thread_lands_on_the_worker() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("reentry")?;
    let (tx, rx) = crossbeam_channel::unbounded();
    scheduler.start();

    let reply = tx.clone();
    scheduler.schedule(FnCommand::new(Priority::High, "issue call", move |cx| {
        let reentry = Reentry::capture(cx);
        assert_eq!(reentry.priority(), Priority::High);
        thread::spawn(move || {
            assert!(reentry.complete("call completed", move |cx| {
                let on_worker = cx.scheduler().is_worker_thread();
                let _ = reply.send(if on_worker { "on worker" } else { "elsewhere" });
                Ok(())
            }));
        });
        Ok(())
    }));

    assert_eq!(next(&rx), "on worker");
    Ok(())
}

#[test]
fn reentry_with_a_stale_binding_cancels() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("stale")?;
    let (tx, rx) = crossbeam_channel::unbounded();
    scheduler.start();

    let binding = Arc::new(Flag(AtomicBool::new(true)));
    let live = Arc::clone(&binding);
    let reply = tx.clone();
    let command = FnCommand::new(Priority::High, "issue call", move |cx| {
        let reentry = Reentry::capture(cx);
        // the context is resumed before the reply arrives
        live.0.store(false, Ordering::SeqCst);
        let cancelled = reply.clone();
        thread::spawn(move || {
            reentry.complete_with(
                "call completed",
                move |_| {
                    let _ = reply.send("ran");
                    Ok(())
                },
                move || {
                    let _ = cancelled.send("cancelled");
                },
            );
        });
        Ok(())
    })
    .bound_to(binding);
    scheduler.schedule(command);

    assert_eq!(next(&rx), "cancelled");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    Ok(())
}

#[test]
fn async_commands_are_tracked_until_dequeued() -> eyre::Result<()> {
    let (_pool, scheduler) = scheduler("async")?;
    let (tx, rx) = crossbeam_channel::unbounded();

    scheduler.schedule(record(Priority::Normal, "sync", &tx).sync());
    assert!(!scheduler.has_async_commands());
    scheduler.schedule(record(Priority::Normal, "async", &tx));
    assert!(scheduler.has_async_commands());

    scheduler.start();
    assert_eq!(next(&rx), "sync");
    assert_eq!(next(&rx), "async");
    assert!(!scheduler.has_async_commands());
    Ok(())
}
