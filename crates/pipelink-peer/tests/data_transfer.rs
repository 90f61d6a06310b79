#![cfg(unix)]

mod common;

use std::time::Duration;

use bytes::Bytes;
use pipelink_peer::{
    CancellationToken, Client, ClientConfig, Event, JsonFormatter, Server, ServerConfig,
};
use serde::{Deserialize, Serialize};

use common::{endpoint, next_connected, next_message, sha256_hex, unique_dir};

async fn raw_pair(
    tag: &str,
) -> (
    Server<Bytes>,
    pipelink_peer::Events<Bytes>,
    Client<Bytes>,
    pipelink_peer::Events<Bytes>,
) {
    let dir = unique_dir(tag);
    let cancel = CancellationToken::new();
    let (server, mut server_events) = Server::raw(ServerConfig::new(endpoint(&dir)));
    server.start(&cancel).await.expect("server should start");
    let (client, mut client_events) = Client::raw(ClientConfig::new(endpoint(&dir)));
    client.connect(&cancel).await.expect("client should connect");
    next_connected(&mut server_events).await;
    next_connected(&mut client_events).await;
    (server, server_events, client, client_events)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn empty_message_is_delivered_without_disconnecting() {
    let (server, mut server_events, client, _client_events) = raw_pair("empty").await;
    let cancel = CancellationToken::new();

    client
        .write_raw(&[], &cancel)
        .await
        .expect("empty write should succeed");
    let (_, message) = next_message(&mut server_events).await;
    assert!(message.is_empty());
    assert_eq!(sha256_hex(&message), sha256_hex(&[]));

    // The link must still carry data after a zero-length frame.
    client
        .write_raw(b"after", &cancel)
        .await
        .expect("write after empty should succeed");
    let (_, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"after");

    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(event) = server_events.try_recv() {
        assert!(
            !matches!(event, Event::Disconnected { .. }),
            "server should not see a disconnect, got {event:?}"
        );
    }
    assert!(client.is_connected());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn messages_of_many_sizes_arrive_intact() {
    let (_server, mut server_events, client, _client_events) = raw_pair("sizes").await;
    let cancel = CancellationToken::new();
    let sizes = [0usize, 1, 2, 3, 255, 4096, 65_537, 1 << 20];

    for &size in &sizes {
        let data = pattern(size);
        client
            .write_raw(&data, &cancel)
            .await
            .expect("write should succeed");
        let (_, message) = next_message(&mut server_events).await;
        assert_eq!(message.len(), size);
        assert_eq!(sha256_hex(&message), sha256_hex(&data), "size {size}");
    }
}

#[tokio::test]
async fn sub_range_of_a_padded_buffer_is_sent_exactly() {
    let (_server, mut server_events, client, _client_events) = raw_pair("range").await;
    let cancel = CancellationToken::new();

    let values: [&[u8]; 3] = [b"abc", b"\x00\x01\x02", b"xyz"];
    for value in values {
        let mut padded = vec![0xAA, 0xBB];
        padded.extend_from_slice(value);
        padded.extend_from_slice(&[0xCC, 0xDD]);

        client
            .write_raw_range(&padded, 2, 3, &cancel)
            .await
            .expect("range write should succeed");
        let (_, message) = next_message(&mut server_events).await;
        assert_eq!(sha256_hex(&message), sha256_hex(value));
    }
}

#[tokio::test]
async fn out_of_bounds_range_is_rejected_and_link_survives() {
    let (_server, mut server_events, client, _client_events) = raw_pair("badrange").await;
    let cancel = CancellationToken::new();
    let buffer = [1u8, 2, 3, 4];

    let err = client
        .write_raw_range(&buffer, 3, 2, &cancel)
        .await
        .expect_err("range past the end should fail");
    assert_eq!(err.kind(), pipelink_peer::ErrorKind::InvalidRange);

    client
        .write_raw_range(&buffer, 1, 0, &cancel)
        .await
        .expect("empty range inside the buffer should succeed");
    let (_, message) = next_message(&mut server_events).await;
    assert!(message.is_empty());
    assert!(client.is_connected());
}

#[tokio::test]
async fn server_replies_reach_the_right_client() {
    let (server, mut server_events, client, mut client_events) = raw_pair("reply").await;
    let cancel = CancellationToken::new();

    client
        .write_raw(b"ping", &cancel)
        .await
        .expect("write should succeed");
    let (from, message) = next_message(&mut server_events).await;
    assert_eq!(&message[..], b"ping");

    server
        .write_raw_to(from, b"pong", &cancel)
        .await
        .expect("reply should succeed");
    let (_, reply) = next_message(&mut client_events).await;
    assert_eq!(&reply[..], b"pong");
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    values: Vec<i64>,
}

#[tokio::test]
async fn typed_messages_round_trip_through_json() {
    let dir = unique_dir("json");
    let cancel = CancellationToken::new();
    let (server, mut server_events) =
        Server::new(ServerConfig::new(endpoint(&dir)), JsonFormatter::<Reading>::new());
    server.start(&cancel).await.expect("server should start");
    let (client, mut client_events) =
        Client::new(ClientConfig::new(endpoint(&dir)), JsonFormatter::<Reading>::new());
    client.connect(&cancel).await.expect("client should connect");

    let reading = Reading {
        sensor: "t1".to_string(),
        values: vec![-3, 0, 42],
    };
    client
        .send(&reading, &cancel)
        .await
        .expect("send should succeed");
    let (from, received) = next_message(&mut server_events).await;
    assert_eq!(received, reading);

    let echo = Reading {
        sensor: received.sensor.to_uppercase(),
        values: received.values.iter().rev().copied().collect(),
    };
    server
        .write_to(from, &echo, &cancel)
        .await
        .expect("reply should succeed");
    let (_, reply) = next_message(&mut client_events).await;
    assert_eq!(reply, echo);
}
