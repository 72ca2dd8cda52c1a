//! Ordering, skip/recache, timeout replacement, and the at-most-one
//! scheduling guarantee.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use rookery::{anon_send, ActorSystem, Behavior, Message, Reply, RuntimeConfig, Scope};

#[derive(Clone)]
struct Swap;

fn system() -> ActorSystem {
    ActorSystem::new(RuntimeConfig::default().with_threads(4))
}

#[test]
fn per_sender_fifo_within_priority() {
    let system = system();
    let (tx, rx) = mpsc::channel::<u64>();

    let receiver = {
        let tx = tx.clone();
        system.spawn(move |_scope: &mut Scope<'_>| {
            let tx = tx.clone();
            Behavior::new()
                .on::<u64, _>(move |_scope: &mut Scope<'_>, n: &mut u64| {
                    tx.send(*n).expect("report");
                    Reply::Done
                })
                .build()
        })
    };

    let receiver_for_sender = receiver.clone();
    let _sender = system.spawn_blocking(move |scope: &mut rookery::BlockingScope<'_>| {
        for i in 0..200_u64 {
            scope.send(&receiver_for_sender, i);
        }
    });

    for expected in 0..200_u64 {
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok(expected),
            "FIFO violated at {expected}"
        );
    }
    system.shutdown();
}

#[test]
fn skipped_envelope_redispatches_after_become() {
    let system = system();
    let (tx, rx) = mpsc::channel::<String>();

    // H1 matches only numbers; everything else is skipped to the cache.
    // Handling a number switches to H2, which must see the cached string
    // before any newer envelope.
    let actor = {
        let tx = tx.clone();
        system.spawn(move |scope: &mut Scope<'_>| {
            scope.set_default_handler(|_scope: &mut Scope<'_>, _msg: &mut Message| Reply::Skip);
            let tx = tx.clone();
            Behavior::new()
                .on::<u64, _>(move |scope: &mut Scope<'_>, _n: &mut u64| {
                    let tx = tx.clone();
                    let h2 = Behavior::new()
                        .on::<String, _>(move |_scope: &mut Scope<'_>, s: &mut String| {
                            tx.send(s.clone()).expect("report");
                            Reply::Done
                        })
                        .build();
                    scope.do_become(h2, true);
                    Reply::Done
                })
                .build()
        })
    };

    anon_send(&actor, "x".to_string());
    anon_send(&actor, 42_u64);
    anon_send(&actor, "y".to_string());

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)),
        Ok("x".to_string()),
        "cached envelope must be re-dispatched first"
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("y".to_string()));
    system.shutdown();
}

#[test]
fn stale_timeout_is_dropped_after_become() {
    let system = system();
    let (tx, rx) = mpsc::channel::<&'static str>();

    let actor = {
        let tx = tx.clone();
        system.spawn(move |_scope: &mut Scope<'_>| {
            let on_idle = tx.clone();
            let tx = tx.clone();
            Behavior::new()
                .on::<Swap, _>(move |scope: &mut Scope<'_>, _msg: &mut Swap| {
                    let tx = tx.clone();
                    let h2 = Behavior::new()
                        .on::<u64, _>(move |_scope: &mut Scope<'_>, _n: &mut u64| {
                            tx.send("msg").expect("report");
                            Reply::Done
                        })
                        .build();
                    scope.do_become(h2, true);
                    Reply::Done
                })
                .with_idle_timeout(Duration::from_millis(200), move |_scope: &mut Scope<'_>| {
                    on_idle.send("timeout").expect("report");
                })
                .build()
        })
    };

    // Replace the behavior well before the 200ms timeout fires.
    anon_send(&actor, Swap);
    // The original timeout envelope arrives anyway but must be classified
    // expired and dropped.
    std::thread::sleep(Duration::from_millis(500));
    assert!(
        rx.try_recv().is_err(),
        "stale timeout fired after the behavior changed"
    );
    // The new behavior is live.
    anon_send(&actor, 7_u64);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("msg"));
    system.shutdown();
}

#[test]
fn handlers_never_overlap_under_concurrent_senders() {
    let system = system();
    let busy = Arc::new(AtomicBool::new(false));
    let violated = Arc::new(AtomicBool::new(false));
    let count = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    const SENDERS: u64 = 4;
    const PER_SENDER: u64 = 250;

    let actor = {
        let busy = Arc::clone(&busy);
        let violated = Arc::clone(&violated);
        let count = Arc::clone(&count);
        system.spawn(move |_scope: &mut Scope<'_>| {
            let busy = Arc::clone(&busy);
            let violated = Arc::clone(&violated);
            let count = Arc::clone(&count);
            let done_tx = done_tx.clone();
            Behavior::new()
                .on::<u64, _>(move |_scope: &mut Scope<'_>, _n: &mut u64| {
                    if busy.swap(true, Ordering::AcqRel) {
                        violated.store(true, Ordering::Release);
                    }
                    std::hint::spin_loop();
                    busy.store(false, Ordering::Release);
                    if count.fetch_add(1, Ordering::AcqRel) + 1 == SENDERS * PER_SENDER {
                        done_tx.send(()).expect("report");
                    }
                    Reply::Done
                })
                .build()
        })
    };

    let mut senders = Vec::new();
    for t in 0..SENDERS {
        let actor = actor.clone();
        senders.push(std::thread::spawn(move || {
            for i in 0..PER_SENDER {
                anon_send(&actor, t * PER_SENDER + i);
            }
        }));
    }
    for s in senders {
        s.join().expect("sender thread");
    }

    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("all envelopes processed");
    assert!(
        !violated.load(Ordering::Acquire),
        "two workers executed the actor at once"
    );
    system.shutdown();
}
