//! Blocking actors, detached actors, groups, the registry, and the info
//! request.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use rookery::{
    anon_send, send_exit, ActorInfo, ActorSystem, Behavior, BlockingScope, ExitReason, Group,
    Message, Reply, RuntimeConfig, Scope, SpawnOptions, SysRequest,
};

#[derive(Clone)]
struct Ping;

#[derive(Clone)]
struct Pong;

#[derive(Clone)]
struct Leave;

#[derive(Clone)]
struct Never;

fn system() -> ActorSystem {
    ActorSystem::new(RuntimeConfig::default().with_threads(2))
}

fn keep_alive() -> Behavior {
    Behavior::new()
        .on::<Never, _>(|_scope: &mut Scope<'_>, _msg: &mut Never| Reply::Done)
        .build()
}

#[test]
fn blocking_actor_awaits_requests_and_reads_info() {
    let system = system();
    let (tx, rx) = mpsc::channel::<&'static str>();

    let echo = system.spawn_opts(SpawnOptions::named("echo"), |_scope: &mut Scope<'_>| {
        Behavior::new()
            .on::<Ping, _>(|_scope: &mut Scope<'_>, _msg: &mut Ping| Reply::with(Pong))
            .build()
    });

    let _driver = system.spawn_blocking(move |scope: &mut BlockingScope<'_>| {
        let pong_report = tx.clone();
        scope.request_await(
            &echo,
            Ping,
            Behavior::new()
                .on::<Pong, _>(move |_scope: &mut Scope<'_>, _msg: &mut Pong| {
                    pong_report.send("pong").expect("report");
                    Reply::Done
                })
                .build(),
        );
        // Transport-level meta request: the actor answers with its own
        // address and name.
        let info_report = tx.clone();
        scope.request_await(
            &echo,
            SysRequest {
                key: "info".to_string(),
            },
            Behavior::new()
                .on::<ActorInfo, _>(move |_scope: &mut Scope<'_>, info: &mut ActorInfo| {
                    if info.name == "echo" {
                        info_report.send("info").expect("report");
                    }
                    Reply::Done
                })
                .build(),
        );
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("pong"));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("info"));
    system.shutdown();
}

#[test]
fn blocking_receive_handles_messages_in_order() {
    let system = system();
    let (tx, rx) = mpsc::channel::<u64>();
    let (addr_tx, addr_rx) = mpsc::channel::<rookery::ActorRef>();

    let _worker = {
        let tx = tx.clone();
        system.spawn_blocking(move |scope: &mut BlockingScope<'_>| {
            addr_tx.send(scope.self_ref()).expect("handoff");
            for _ in 0..3 {
                let tx = tx.clone();
                scope.receive(
                    Behavior::new()
                        .on::<u64, _>(move |_scope: &mut Scope<'_>, n: &mut u64| {
                            tx.send(*n).expect("report");
                            Reply::Done
                        })
                        .build(),
                );
            }
        })
    };

    let worker = addr_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("worker up");
    for n in [1_u64, 2, 3] {
        anon_send(&worker, n);
    }
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(2));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(3));
    system.await_all_actors_done();
    system.shutdown();
}

#[test]
fn blocking_receive_idle_timeout_returns() {
    let system = system();
    let (tx, rx) = mpsc::channel::<&'static str>();

    let _idler = system.spawn_blocking(move |scope: &mut BlockingScope<'_>| {
        let report = tx.clone();
        scope.receive(
            Behavior::new()
                .on::<Never, _>(|_scope: &mut Scope<'_>, _msg: &mut Never| Reply::Done)
                .with_idle_timeout(Duration::from_millis(50), move |_scope: &mut Scope<'_>| {
                    report.send("idle").expect("report");
                })
                .build(),
        );
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("idle"));
    system.await_all_actors_done();
    system.shutdown();
}

#[test]
fn groups_broadcast_and_forget_members() {
    let system = system();
    let group = system.group("workers");
    let (tx, rx) = mpsc::channel::<&'static str>();

    let spawn_member = |tag: &'static str| {
        let group = Arc::clone(&group);
        let tx = tx.clone();
        system.spawn(move |scope: &mut Scope<'_>| {
            let joined: Arc<dyn Group> = group;
            scope.join(Arc::clone(&joined));
            let tx = tx.clone();
            Behavior::new()
                .on::<u64, _>(move |_scope: &mut Scope<'_>, _n: &mut u64| {
                    tx.send(tag).expect("report");
                    Reply::Done
                })
                .on::<Leave, _>(move |scope: &mut Scope<'_>, _msg: &mut Leave| {
                    scope.leave(&Arc::clone(&joined));
                    Reply::Done
                })
                .build()
        })
    };

    let first = spawn_member("first");
    let second = spawn_member("second");

    let deadline = Instant::now() + Duration::from_secs(5);
    while group.member_count() < 2 {
        assert!(Instant::now() < deadline, "members never joined");
        std::thread::yield_now();
    }

    group.broadcast(None, Message::new(1_u64));
    let mut tags = vec![
        rx.recv_timeout(Duration::from_secs(5)).expect("delivery"),
        rx.recv_timeout(Duration::from_secs(5)).expect("delivery"),
    ];
    tags.sort_unstable();
    assert_eq!(tags, vec!["first", "second"]);

    // One member leaves; the next broadcast reaches only the other.
    anon_send(&first, Leave);
    let deadline = Instant::now() + Duration::from_secs(5);
    while group.member_count() > 1 {
        assert!(Instant::now() < deadline, "leave never took effect");
        std::thread::yield_now();
    }
    group.broadcast(None, Message::new(2_u64));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok("second"));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // Termination unsubscribes the survivor.
    send_exit(&second.addr(), &second, ExitReason::Kill);
    let deadline = Instant::now() + Duration::from_secs(5);
    while group.member_count() > 0 {
        assert!(Instant::now() < deadline, "cleanup never unsubscribed");
        std::thread::yield_now();
    }
    system.shutdown();
}

#[test]
fn registry_resolves_names_and_ids() {
    let system = system();
    let svc = system.spawn_opts(SpawnOptions::named("svc"), |_scope: &mut Scope<'_>| {
        keep_alive()
    });

    system.registry().put_named("svc", svc.addr());
    let resolved = system.registry().get_named("svc").expect("named lookup");
    assert_eq!(resolved.id(), svc.id());
    assert!(system.registry().get(svc.id()).is_some());

    system.registry().erase_named("svc");
    assert!(system.registry().get_named("svc").is_none());

    send_exit(&svc.addr(), &svc, ExitReason::Kill);
    let deadline = Instant::now() + Duration::from_secs(5);
    while system.registry().get(svc.id()).is_some() {
        assert!(Instant::now() < deadline, "id entry never cleared");
        std::thread::yield_now();
    }
    system.shutdown();
}

#[test]
fn transports_can_drive_an_actor_synchronously() {
    let system = system();
    let (tx, rx) = mpsc::channel::<u64>();

    // A lazy actor is never handed to the pool, so a transport can push
    // single events through it on its own thread.
    let actor = {
        let tx = tx.clone();
        system.spawn_opts(
            SpawnOptions::default().lazy(),
            move |_scope: &mut Scope<'_>| {
                let tx = tx.clone();
                Behavior::new()
                    .on::<u64, _>(move |_scope: &mut Scope<'_>, n: &mut u64| {
                        tx.send(*n).expect("report");
                        Reply::Done
                    })
                    .build()
            },
        )
    };

    actor.exec_single_event(rookery::Envelope::make(
        None,
        rookery::MessageId::make(),
        Message::new(9_u64),
    ));
    // Synchronous: the handler already ran on this thread.
    assert_eq!(rx.try_recv(), Ok(9));
    system.shutdown();
}

#[test]
fn detached_actor_runs_on_its_private_thread() {
    let system = system();
    let (tx, rx) = mpsc::channel::<String>();

    let det = {
        let tx = tx.clone();
        system.spawn_opts(
            SpawnOptions::named("det").detached(),
            move |_scope: &mut Scope<'_>| {
                let tx = tx.clone();
                Behavior::new()
                    .on::<Ping, _>(move |_scope: &mut Scope<'_>, _msg: &mut Ping| {
                        let thread = std::thread::current()
                            .name()
                            .unwrap_or("<unnamed>")
                            .to_string();
                        tx.send(thread).expect("report");
                        Reply::Done
                    })
                    .build()
            },
        )
    };

    anon_send(&det, Ping);
    let thread = rx.recv_timeout(Duration::from_secs(5)).expect("handled");
    assert!(
        thread.starts_with("rookery-private-"),
        "handler ran on {thread}"
    );

    // The private thread winds down with the actor.
    send_exit(&det.addr(), &det, ExitReason::Kill);
    system.await_all_actors_done();
    system.shutdown();
}
