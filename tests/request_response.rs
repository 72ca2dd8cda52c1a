//! Request/response routing, end to end: matched responses invoke exactly
//! the registered handler, mismatched payloads surface as
//! unexpected-response errors, silent receivers trip request timeouts, and
//! dead receivers bounce.

use std::sync::mpsc;
use std::time::Duration;

use rookery::{
    send_exit, ActorSystem, Behavior, DownMsg, Error, ExitReason, Reply, RuntimeConfig, Scope,
};

#[derive(Clone)]
struct Ping;

#[derive(Clone)]
struct Pong;

#[derive(Clone)]
struct Never;

fn system() -> ActorSystem {
    ActorSystem::new(RuntimeConfig::default().with_threads(2))
}

#[test]
fn response_invokes_exactly_the_registered_handler() {
    let system = system();
    let (tx, rx) = mpsc::channel::<&'static str>();

    let bob = system.spawn(|_scope: &mut Scope<'_>| {
        Behavior::new()
            .on::<Ping, _>(|_scope: &mut Scope<'_>, _msg: &mut Ping| Reply::with(Pong))
            .build()
    });

    let bob_for_alice = bob.clone();
    let _alice = system.spawn(move |scope: &mut Scope<'_>| {
        let report = tx.clone();
        scope.request(
            &bob_for_alice,
            Ping,
            Behavior::new()
                .on::<Pong, _>(move |_scope: &mut Scope<'_>, _msg: &mut Pong| {
                    report.send("pong").expect("report");
                    Reply::Done
                })
                .build(),
        );
        Behavior::new().build()
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("pong"));
    // Exactly once: nothing further may invoke the handler.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    system.shutdown();
}

#[test]
fn mismatched_response_payload_reaches_the_error_handler() {
    let system = system();
    let (tx, rx) = mpsc::channel::<String>();

    // Bob answers a Ping with a string while Alice expects a number.
    let bob = system.spawn(|_scope: &mut Scope<'_>| {
        Behavior::new()
            .on::<Ping, _>(|_scope: &mut Scope<'_>, _msg: &mut Ping| Reply::with("a string"))
            .build()
    });

    let bob_for_alice = bob.clone();
    let _alice = system.spawn(move |scope: &mut Scope<'_>| {
        let report = tx.clone();
        scope.set_error_handler(move |scope: &mut Scope<'_>, err: Error| {
            if let Error::UnexpectedResponse(payload) = &err {
                let carried = payload.get::<&str>().copied().unwrap_or("<missing>");
                report.send(format!("unexpected:{carried}")).expect("report");
            } else {
                report.send(format!("other:{err}")).expect("report");
            }
            scope.quit(ExitReason::Error(err));
        });
        scope.request(
            &bob_for_alice,
            Ping,
            Behavior::new()
                .on::<u64, _>(|_scope: &mut Scope<'_>, _n: &mut u64| Reply::Done)
                .build(),
        );
        Behavior::new().build()
    });

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)),
        Ok("unexpected:a string".to_string())
    );
    system.shutdown();
}

#[test]
fn multiplexed_request_timeout_fires() {
    let system = system();
    let (tx, rx) = mpsc::channel::<&'static str>();

    // The receiver skips every Ping, so no response is ever produced.
    let silent = system.spawn(|_scope: &mut Scope<'_>| {
        Behavior::new()
            .on::<Ping, _>(|_scope: &mut Scope<'_>, _msg: &mut Ping| Reply::Skip)
            .build()
    });

    let silent_for_alice = silent.clone();
    let _alice = system.spawn(move |scope: &mut Scope<'_>| {
        let report = tx.clone();
        scope.set_error_handler(move |scope: &mut Scope<'_>, err: Error| {
            if matches!(err, Error::RequestTimeout) {
                report.send("timeout").expect("report");
            }
            scope.quit(ExitReason::Error(err));
        });
        scope.request(
            &silent_for_alice,
            Ping,
            Behavior::new()
                .on::<Pong, _>(|_scope: &mut Scope<'_>, _msg: &mut Pong| Reply::Done)
                .with_idle_timeout(Duration::from_millis(50), |_scope: &mut Scope<'_>| {})
                .build(),
        );
        Behavior::new().build()
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("timeout"));
    system.shutdown();
}

#[test]
fn requests_to_a_dead_actor_bounce() {
    let system = system();
    let (tx, rx) = mpsc::channel::<&'static str>();

    let victim = system.spawn(|_scope: &mut Scope<'_>| {
        Behavior::new()
            .on::<Ping, _>(|_scope: &mut Scope<'_>, _msg: &mut Ping| Reply::with(Pong))
            .build()
    });

    // The watcher waits for the victim's death, then requests against the
    // corpse; the closed mailbox must answer with a failure.
    let victim_for_watcher = victim.clone();
    let _watcher = system.spawn(move |scope: &mut Scope<'_>| {
        let report = tx.clone();
        scope.set_error_handler(move |scope: &mut Scope<'_>, err: Error| {
            if matches!(err, Error::QueueClosed) {
                report.send("bounced").expect("report");
            }
            scope.quit(ExitReason::Normal);
        });
        let corpse = victim_for_watcher.clone();
        scope.set_down_handler(move |scope: &mut Scope<'_>, _down: DownMsg| {
            scope.request(
                &corpse,
                Ping,
                Behavior::new()
                    .on::<Pong, _>(|_scope: &mut Scope<'_>, _msg: &mut Pong| Reply::Done)
                    .build(),
            );
        });
        scope.monitor(&victim_for_watcher);
        send_exit(&scope.addr(), &victim_for_watcher, ExitReason::Kill);
        Behavior::new()
            .on::<Never, _>(|_scope: &mut Scope<'_>, _msg: &mut Never| Reply::Done)
            .build()
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("bounced"));
    system.shutdown();
}
