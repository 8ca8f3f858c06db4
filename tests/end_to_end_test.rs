//! Whole-server tests: a real TCP client against the simulated instrument
//! stack, exercising subscription filtering, detuning arithmetic, control
//! requests, backfill and graceful shutdown together.

use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;

use wavemux::app::App;
use wavemux::config::Config;
use wavemux::measurement::Status;
use wavemux::network::protocol::{
    read_message, write_message, ClientHello, ClientRequest, HandshakeVerdict, Push, ServerHello,
    SubscriptionRequest,
};
use wavemux::version::VersionTuple;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const CESIUM_REFERENCE: f64 = 3.517e14;

type Reader = BufReader<OwnedReadHalf>;

fn e2e_config() -> Config {
    Config::from_toml(
        r#"
        [server]
        name = "wavemux-e2e"
        listen = "127.0.0.1:0"
        ping_interval = "60s"

        [switcher]
        kind = "simulated"

        [acquisition]
        simulate = true

        [sink]
        kind = "null"

        [[channels]]
        name = "cesium"
        reference = 3.517e14
        switcher_position = 1
        exposure_ms = 5

        [[channels]]
        name = "repump"
        reference = 3.843e14
        switcher_position = 2
        exposure_ms = 5
    "#,
    )
    .unwrap()
}

async fn handshake(app: &App, client: &str, subscriptions: Vec<SubscriptionRequest>) -> (Reader, OwnedWriteHalf) {
    let stream = TcpStream::connect(app.local_addr()).await.unwrap();
    let (read, write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut writer = write;
    let hello = ClientHello {
        client: client.to_string(),
        version: VersionTuple::server(),
        subscriptions,
    };
    write_message(&mut writer, &hello).await.unwrap();
    let reply: ServerHello = tokio::time::timeout(RECV_TIMEOUT, read_message(&mut reader))
        .await
        .expect("timed out waiting for the server hello")
        .unwrap()
        .expect("server closed during the handshake");
    assert_eq!(reply.verdict, HandshakeVerdict::Accepted);
    (reader, writer)
}

async fn recv(reader: &mut Reader) -> Option<Push> {
    tokio::time::timeout(RECV_TIMEOUT, read_message(reader))
        .await
        .expect("timed out waiting for a push")
        .unwrap()
}

/// Reads pushes until one satisfies `want`, skipping interleaved traffic.
async fn recv_until(reader: &mut Reader, mut want: impl FnMut(&Push) -> bool) -> Push {
    for _ in 0..500 {
        match recv(reader).await {
            Some(push) => {
                if want(&push) {
                    return push;
                }
            }
            None => panic!("connection closed while waiting for a push"),
        }
    }
    panic!("expected push never arrived");
}

#[tokio::test]
async fn test_subscriber_receives_only_its_channel_with_detuning() {
    let app = App::start(e2e_config()).await.unwrap();
    sleep(Duration::from_millis(150)).await;

    let (mut reader, _writer) = handshake(
        &app,
        "monitor",
        vec![SubscriptionRequest::with_alias("cesium", "Cs 352 THz")],
    )
    .await;

    // State first, then the backfilled latest value, then live traffic.
    assert!(matches!(recv(&mut reader).await, Some(Push::State(_))));

    let mut seen = 0;
    while seen < 10 {
        match recv(&mut reader).await {
            Some(Push::Measurement(m)) => {
                seen += 1;
                assert_eq!(m.channel, "cesium", "only the subscribed channel may arrive");
                assert_ne!(m.status, Status::Error);
                match m.status {
                    Status::Ok => {
                        let value = m.value.expect("ok readings carry a value");
                        let detuning = m.detuning.expect("ok readings carry a detuning");
                        assert!(
                            (detuning - (value - CESIUM_REFERENCE)).abs() < 1.0,
                            "detuning must be value minus reference"
                        );
                        assert!(detuning.abs() < 3e9, "implausible detuning {detuning}");
                    }
                    _ => {
                        assert!(m.value.is_none());
                        assert!(m.detuning.is_none());
                    }
                }
            }
            Some(_) => {}
            None => panic!("connection closed mid-stream"),
        }
    }
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_control_requests_drive_the_scheduler() {
    let app = App::start(e2e_config()).await.unwrap();
    let (mut reader, mut writer) = handshake(&app, "controller", Vec::new()).await;
    assert!(matches!(recv(&mut reader).await, Some(Push::State(_))));

    write_message(
        &mut writer,
        &ClientRequest::Lock {
            channel: "repump".to_string(),
        },
    )
    .await
    .unwrap();
    let push = recv_until(&mut reader, |p| matches!(p, Push::State(_))).await;
    match push {
        Push::State(state) => assert_eq!(state.locked.as_deref(), Some("repump")),
        _ => unreachable!(),
    }

    write_message(&mut writer, &ClientRequest::Pause).await.unwrap();
    let push = recv_until(
        &mut reader,
        |p| matches!(p, Push::State(state) if !state.running),
    )
    .await;
    match push {
        Push::State(state) => assert_eq!(state.locked.as_deref(), Some("repump")),
        _ => unreachable!(),
    }

    write_message(&mut writer, &ClientRequest::Resume).await.unwrap();
    recv_until(
        &mut reader,
        |p| matches!(p, Push::State(state) if state.running),
    )
    .await;

    write_message(&mut writer, &ClientRequest::Unlock).await.unwrap();
    recv_until(
        &mut reader,
        |p| matches!(p, Push::State(state) if state.locked.is_none()),
    )
    .await;

    // Locking an unknown channel is answered with an error push and the
    // session stays open.
    write_message(
        &mut writer,
        &ClientRequest::Lock {
            channel: "phantom".to_string(),
        },
    )
    .await
    .unwrap();
    let push = recv_until(&mut reader, |p| matches!(p, Push::Error { .. })).await;
    match push {
        Push::Error { message } => assert!(message.contains("phantom")),
        _ => unreachable!(),
    }

    write_message(&mut writer, &ClientRequest::Ping).await.unwrap();
    recv_until(&mut reader, |p| matches!(p, Push::Pong)).await;

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backfill_seeds_a_subscriber_while_paused() {
    let app = App::start(e2e_config()).await.unwrap();
    sleep(Duration::from_millis(150)).await;

    // Pause acquisition so the late subscriber cannot receive live traffic.
    let (mut ctl_reader, mut ctl_writer) = handshake(&app, "controller", Vec::new()).await;
    assert!(matches!(recv(&mut ctl_reader).await, Some(Push::State(_))));
    write_message(&mut ctl_writer, &ClientRequest::Pause).await.unwrap();
    recv_until(
        &mut ctl_reader,
        |p| matches!(p, Push::State(state) if !state.running),
    )
    .await;

    let (mut reader, _writer) =
        handshake(&app, "latecomer", vec![SubscriptionRequest::new("cesium")]).await;
    match recv(&mut reader).await {
        Some(Push::State(state)) => assert!(!state.running),
        other => panic!("expected the initial state push, got {other:?}"),
    }
    match recv(&mut reader).await {
        Some(Push::Measurement(m)) => {
            assert_eq!(m.channel, "cesium", "backfill must come from the channel's ring");
        }
        other => panic!("expected a backfilled measurement, got {other:?}"),
    }

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resubscribing_repeats_no_backfill() {
    let app = App::start(e2e_config()).await.unwrap();
    sleep(Duration::from_millis(150)).await;

    // Freeze acquisition so the queue holds only what the handshake seeds.
    let (mut ctl_reader, mut ctl_writer) = handshake(&app, "controller", Vec::new()).await;
    assert!(matches!(recv(&mut ctl_reader).await, Some(Push::State(_))));
    write_message(&mut ctl_writer, &ClientRequest::Pause).await.unwrap();
    recv_until(
        &mut ctl_reader,
        |p| matches!(p, Push::State(state) if !state.running),
    )
    .await;

    let (mut reader, mut writer) =
        handshake(&app, "again", vec![SubscriptionRequest::new("cesium")]).await;
    assert!(matches!(recv(&mut reader).await, Some(Push::State(_))));

    // The pong bounds the backfill: everything seeded sits ahead of it.
    write_message(&mut writer, &ClientRequest::Ping).await.unwrap();
    let mut backfilled = 0;
    loop {
        match recv(&mut reader).await {
            Some(Push::Measurement(m)) => {
                assert_eq!(m.channel, "cesium");
                backfilled += 1;
            }
            Some(Push::Pong) => break,
            other => panic!("unexpected push during backfill: {other:?}"),
        }
    }
    assert!(backfilled > 0, "the ring had data to seed");

    write_message(
        &mut writer,
        &ClientRequest::Subscribe {
            channel: "cesium".to_string(),
            alias: None,
        },
    )
    .await
    .unwrap();
    match recv(&mut reader).await {
        Some(Push::Subscription(decision)) => assert!(decision.accepted),
        other => panic!("expected only the subscription ack, got {other:?}"),
    }
    // Nothing may follow the ack while acquisition is paused.
    write_message(&mut writer, &ClientRequest::Ping).await.unwrap();
    assert!(
        matches!(recv(&mut reader).await, Some(Push::Pong)),
        "a repeated subscribe must not replay the ring"
    );

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_closes_client_sessions() {
    let app = App::start(e2e_config()).await.unwrap();
    let (mut reader, _writer) = handshake(&app, "witness", Vec::new()).await;
    assert!(matches!(recv(&mut reader).await, Some(Push::State(_))));

    tokio::time::timeout(Duration::from_secs(5), app.shutdown())
        .await
        .expect("server failed to stop in time")
        .unwrap();

    assert!(
        recv(&mut reader).await.is_none(),
        "shutdown must close the session's socket"
    );
}
