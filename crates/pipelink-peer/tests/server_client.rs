#![cfg(unix)]

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pipelink_peer::{
    CancellationToken, Client, ClientConfig, ConnectionOptions, ErrorKind, Event, JsonFormatter,
    PeerError, ReconnectPolicy, Server, ServerConfig,
};
use tokio::io::AsyncWriteExt;

use common::{
    endpoint, next_connected, next_event, next_message, unique_dir, wait_until, WAIT,
};

fn quick_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::default().with_delay(Duration::from_millis(50))
}

#[tokio::test]
async fn concurrent_sends_keep_per_sender_order() {
    let dir = unique_dir("fifo");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");
    let (client, _client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    client.connect(&cancel).await.expect("client should connect");
    let client = Arc::new(client);

    const TASKS: u8 = 4;
    const PER_TASK: u32 = 100;
    let mut senders = Vec::new();
    for task in 0..TASKS {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        senders.push(tokio::spawn(async move {
            for seq in 0..PER_TASK {
                let mut payload = vec![task];
                payload.extend_from_slice(&seq.to_be_bytes());
                client
                    .write_raw(&payload, &cancel)
                    .await
                    .expect("concurrent write should succeed");
            }
        }));
    }
    for sender in senders {
        sender.await.expect("sender task should not panic");
    }

    let mut last: HashMap<u8, u32> = HashMap::new();
    for _ in 0..(u32::from(TASKS) * PER_TASK) {
        let (_, message) = next_message(&mut server_events).await;
        assert_eq!(message.len(), 5, "frames must never interleave");
        let task = message[0];
        let seq = u32::from_be_bytes([message[1], message[2], message[3], message[4]]);
        if let Some(previous) = last.insert(task, seq) {
            assert_eq!(seq, previous + 1, "task {task} out of order");
        } else {
            assert_eq!(seq, 0);
        }
    }
    assert_eq!(last.len(), usize::from(TASKS));
}

#[tokio::test]
async fn clients_are_isolated_from_each_other() {
    let dir = unique_dir("isolate");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");

    let (first, mut first_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    first.connect(&cancel).await.expect("first client should connect");
    let (second, mut second_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    second.connect(&cancel).await.expect("second client should connect");
    next_connected(&mut first_events).await;
    next_connected(&mut second_events).await;

    first
        .write_raw(b"one", &cancel)
        .await
        .expect("first write should succeed");
    let (first_id, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"one");
    second
        .write_raw(b"two", &cancel)
        .await
        .expect("second write should succeed");
    let (second_id, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"two");
    assert_ne!(first_id, second_id);

    server
        .write_raw_to(first_id, b"only-first", &cancel)
        .await
        .expect("targeted write should succeed");
    let (_, reply) = next_message(&mut first_events).await;
    assert_eq!(&reply[..], b"only-first");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        second_events.try_recv().is_none(),
        "second client must not see the first client's traffic"
    );
    assert_eq!(server.connection_ids().len(), 2);
}

#[tokio::test]
async fn faulty_peer_does_not_disturb_healthy_clients() {
    let dir = unique_dir("fault");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");

    let (healthy, _healthy_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    healthy.connect(&cancel).await.expect("healthy client should connect");
    let healthy_id = next_connected(&mut server_events).await;

    // A peer that promises 100 bytes, sends 3 and hangs up.
    let mut rogue = pipelink_transport::connect(&endpoint(&dir))
        .await
        .expect("raw connect should succeed");
    let rogue_id = next_connected(&mut server_events).await;
    rogue
        .write_all(&[0, 0, 0, 100, 1, 2, 3])
        .await
        .expect("raw write should succeed");
    drop(rogue);

    let mut saw_violation = false;
    loop {
        match next_event(&mut server_events).await {
            Event::ExceptionOccurred {
                connection: Some(id),
                error,
            } if id == rogue_id => {
                assert_eq!(error.kind(), ErrorKind::ProtocolViolation);
                saw_violation = true;
            }
            Event::Disconnected { connection } if connection == rogue_id => break,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_violation, "truncated frame should be reported");

    healthy
        .write_raw(b"still here", &cancel)
        .await
        .expect("healthy client should be unaffected");
    let (from, message) = next_message(&mut server_events).await;
    assert_eq!(from, healthy_id);
    assert_eq!(&message[..], b"still here");
    assert_eq!(server.connection_ids(), vec![healthy_id]);
}

#[tokio::test]
async fn client_reconnects_after_being_kicked() {
    let dir = unique_dir("kick");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");
    let (client, mut client_events) =
        Client::raw(ClientConfig::new(endpoint(&dir)).with_reconnect(quick_reconnect()));
    client.connect(&cancel).await.expect("client should connect");
    let before = client.connection_id().expect("client should have a connection");
    next_connected(&mut client_events).await;

    let server_side = next_connected(&mut server_events).await;
    server.kick(server_side).await.expect("kick should succeed");
    assert!(server.connection(server_side).is_none());

    let mut saw_disconnect = false;
    let after = loop {
        match next_event(&mut client_events).await {
            Event::Disconnected { connection } => {
                assert_eq!(connection, before);
                saw_disconnect = true;
            }
            Event::Connected { connection } => break connection,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert!(saw_disconnect);
    assert_ne!(before, after);
    assert!(client.is_connected());

    client
        .write_raw(b"back", &cancel)
        .await
        .expect("write after reconnect should succeed");
    let (from, message) = next_message(&mut server_events).await;
    assert_ne!(from, server_side);
    assert_eq!(&message[..], b"back");
}

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    let dir = unique_dir("restart");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");
    let (client, mut client_events) =
        Client::raw(ClientConfig::new(endpoint(&dir)).with_reconnect(quick_reconnect()));
    client.connect(&cancel).await.expect("client should connect");
    let before = next_connected(&mut client_events).await;
    // Stop only once the server has taken the client out of the backlog;
    // a stream still queued there is reset, not closed.
    next_connected(&mut server_events).await;

    server.stop().await;
    assert!(!server.is_running());
    drop(server);
    match next_event(&mut client_events).await {
        Event::Disconnected { connection } => assert_eq!(connection, before),
        other => panic!("unexpected event {other:?}"),
    }

    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("restarted server should start");
    let after = loop {
        match next_event(&mut client_events).await {
            Event::Connected { connection } => break connection,
            // Attempts that raced the restart are reported and retried.
            Event::ExceptionOccurred {
                connection: None, ..
            } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_ne!(before, after);

    client
        .write_raw(b"hello again", &cancel)
        .await
        .expect("write after restart should succeed");
    let (_, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"hello again");
}

#[tokio::test]
async fn single_connection_server_turns_away_second_client() {
    let dir = unique_dir("single");
    let cancel = CancellationToken::new();
    let (server, mut server_events) =
        Server::raw(ServerConfig::single_connection(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");

    let (first, _first_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    first.connect(&cancel).await.expect("first client should connect");
    next_connected(&mut server_events).await;
    wait_until(|| !server.is_accepting()).await;
    assert!(server.is_running());

    let (second, _second_events) = Client::raw(
        ClientConfig::new(endpoint(&dir))
            .without_reconnect()
            .with_connect_timeout(Duration::from_millis(300)),
    );
    let err = second
        .connect(&cancel)
        .await
        .expect_err("second client should not get through");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    first
        .write_raw(b"still served", &cancel)
        .await
        .expect("first client should still be served");
    let (_, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"still served");
}

#[tokio::test]
async fn rival_server_leaves_single_server_slot_free() {
    let dir = unique_dir("rival");
    let cancel = CancellationToken::new();
    let (server, mut server_events) =
        Server::raw(ServerConfig::single_connection(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");

    let (rival, _rival_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    let err = rival
        .start(&cancel)
        .await
        .expect_err("endpoint is taken");
    assert_eq!(err.kind(), ErrorKind::Transport);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        server_events.try_recv().is_none(),
        "the failed bind must not reach the running server"
    );
    assert!(server.is_accepting());
    assert_eq!(server.connection_count(), 0);

    let (client, _client_events) = Client::raw(
        ClientConfig::new(endpoint(&dir)).with_connect_timeout(Duration::from_secs(2)),
    );
    client.connect(&cancel).await.expect("client should connect");
    next_connected(&mut server_events).await;
    client
        .write_raw(b"first and only", &cancel)
        .await
        .expect("write should succeed");
    let (_, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"first and only");
}

#[tokio::test]
async fn writes_without_a_connection_fail_fast() {
    let dir = unique_dir("notconn");
    let cancel = CancellationToken::new();
    let (client, mut client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));

    let err = client
        .write_raw(b"nobody", &cancel)
        .await
        .expect_err("write without a connection should fail");
    assert!(matches!(err, PeerError::NotConnected));
    match next_event(&mut client_events).await {
        Event::ExceptionOccurred { connection, error } => {
            assert!(connection.is_none());
            assert_eq!(error.kind(), ErrorKind::NotConnected);
        }
        other => panic!("unexpected event {other:?}"),
    }

}

#[tokio::test]
async fn connect_gives_up_after_timeout() {
    let dir = unique_dir("timeout");
    let cancel = CancellationToken::new();
    let (client, _events) = Client::raw(
        ClientConfig::new(endpoint(&dir)).with_connect_timeout(Duration::from_millis(200)),
    );

    let started = tokio::time::Instant::now();
    let err = client
        .connect(&cancel)
        .await
        .expect_err("connect without a server should time out");
    assert!(matches!(err, PeerError::Timeout(limit) if limit == Duration::from_millis(200)));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn connect_honours_cancellation() {
    let dir = unique_dir("cancel");
    let cancel = CancellationToken::new();
    let (client, _events) = Client::raw(ClientConfig::new(endpoint(&dir)));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = tokio::time::timeout(WAIT, client.connect(&cancel))
        .await
        .expect("cancelled connect should return promptly")
        .expect_err("cancelled connect should fail");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let dir = unique_dir("twice");
    let cancel = CancellationToken::new();
    let (server, _server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");
    let err = server
        .start(&cancel)
        .await
        .expect_err("second start should fail");
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);

    let (client, _client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    client.connect(&cancel).await.expect("client should connect");
    let err = client
        .connect(&cancel)
        .await
        .expect_err("second connect should fail");
    assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let dir = unique_dir("bcast");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (client, events) = Client::raw(ClientConfig::new(endpoint(&dir)));
        client.connect(&cancel).await.expect("client should connect");
        clients.push((client, events));
    }
    for _ in 0..3 {
        next_connected(&mut server_events).await;
    }

    let results = server
        .broadcast(&Bytes::from_static(b"to all"), &cancel)
        .await
        .expect("broadcast payload should serialize");
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert!(results.windows(2).all(|pair| pair[0].0 < pair[1].0));

    for (_, events) in clients.iter_mut() {
        let (_, message) = next_message(events).await;
        assert_eq!(&message[..], b"to all");
    }
}

#[tokio::test]
async fn stop_closes_clients_and_frees_the_endpoint() {
    let dir = unique_dir("stop");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");

    let (client, mut client_events) =
        Client::raw(ClientConfig::new(endpoint(&dir)).without_reconnect());
    client.connect(&cancel).await.expect("client should connect");
    let server_side = next_connected(&mut server_events).await;
    next_connected(&mut client_events).await;

    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);
    match next_event(&mut server_events).await {
        Event::Disconnected { connection } => assert_eq!(connection, server_side),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut client_events).await {
        Event::Disconnected { .. } => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert!(!client.is_connected());
    assert!(!endpoint(&dir).socket_path().exists());

    let err = server
        .write_raw_to(server_side, b"late", &cancel)
        .await
        .expect_err("stopped connection should be unknown");
    assert_eq!(err.kind(), ErrorKind::UnknownConnection);

    let (again, _events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    again
        .start(&cancel)
        .await
        .expect("endpoint should be free after stop");
}

#[tokio::test]
async fn malformed_message_is_reported_and_connection_survives() {
    let dir = unique_dir("badjson");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::new(
        ServerConfig::new(endpoint(&dir)),
        JsonFormatter::<serde_json::Value>::new(),
    );
    server.start(&cancel).await.expect("server should start");
    let (client, _client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    client.connect(&cancel).await.expect("client should connect");
    let server_side = next_connected(&mut server_events).await;

    client
        .write_raw(b"{oops", &cancel)
        .await
        .expect("raw write should succeed");
    match next_event(&mut server_events).await {
        Event::ExceptionOccurred { connection, error } => {
            assert_eq!(connection, Some(server_side));
            assert_eq!(error.kind(), ErrorKind::Serialization);
        }
        other => panic!("unexpected event {other:?}"),
    }

    client
        .write_raw(br#"{"ok":true}"#, &cancel)
        .await
        .expect("raw write should succeed");
    let (from, value) = next_message(&mut server_events).await;
    assert_eq!(from, server_side);
    assert_eq!(value, serde_json::json!({ "ok": true }));
    assert!(server
        .connection(server_side)
        .is_some_and(|connection| connection.is_connected()));
}

#[tokio::test]
async fn malformed_message_closes_connection_when_configured() {
    let dir = unique_dir("strictjson");
    let cancel = CancellationToken::new();
    let config = ServerConfig::new(endpoint(&dir))
        .with_connection_options(ConnectionOptions::default().with_close_on_format_error(true));
    let (server, mut server_events) =
        Server::new(config, JsonFormatter::<serde_json::Value>::new());
    server.start(&cancel).await.expect("server should start");
    let (client, _client_events) =
        Client::raw(ClientConfig::new(endpoint(&dir)).without_reconnect());
    client.connect(&cancel).await.expect("client should connect");
    let server_side = next_connected(&mut server_events).await;

    client
        .write_raw(b"not json", &cancel)
        .await
        .expect("raw write should succeed");
    match next_event(&mut server_events).await {
        Event::ExceptionOccurred { error, .. } => {
            assert_eq!(error.kind(), ErrorKind::Serialization)
        }
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut server_events).await {
        Event::Disconnected { connection } => assert_eq!(connection, server_side),
        other => panic!("unexpected event {other:?}"),
    }
    wait_until(|| !client.is_connected()).await;
}

#[tokio::test]
async fn drain_completes_once_the_server_has_read() {
    let dir = unique_dir("drain");
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");
    let (client, _client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    client.connect(&cancel).await.expect("client should connect");

    let payload = vec![7u8; 256 * 1024];
    client
        .write_raw(&payload, &cancel)
        .await
        .expect("write should succeed");
    tokio::time::timeout(WAIT, client.wait_for_drain(&cancel))
        .await
        .expect("drain should finish in time")
        .expect("drain should succeed");
    let (_, message) = next_message(&mut server_events).await;
    assert_eq!(message.len(), payload.len());
    assert!(server.is_running());
}

#[tokio::test]
async fn wait_free_endpoint_takes_over_from_previous_server() {
    let dir = unique_dir("waitfree");
    let cancel = CancellationToken::new();
    let (previous, mut previous_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    previous.start(&cancel).await.expect("first server should start");

    let (eager, _eager_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    let err = eager
        .start(&cancel)
        .await
        .expect_err("bind over a live server should fail");
    assert_eq!(err.kind(), ErrorKind::Transport);

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        previous.stop().await;
    });
    let (patient, _patient_events) = Server::raw(
        ServerConfig::new(endpoint(&dir))
            .with_wait_free_endpoint(true)
            .with_bind_wait_timeout(WAIT),
    );
    patient
        .start(&cancel)
        .await
        .expect("server should bind once the endpoint is free");
    stopper.await.expect("stopper should not panic");
    while let Some(event) = previous_events.try_recv() {
        assert!(
            !matches!(event, Event::Connected { .. }),
            "waiting for the endpoint must not connect to its owner"
        );
    }

    let (client, _client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    client.connect(&cancel).await.expect("client should connect");
    assert!(patient.is_running());
}
