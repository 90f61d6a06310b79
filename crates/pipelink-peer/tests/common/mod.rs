#![allow(dead_code)]

use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use pipelink_peer::{ConnectionId, Endpoint, Event, Events};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn unique_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "pl-{}-{}-{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

/// The endpoint name both sides rendezvous on, scoped to `dir`.
pub fn endpoint(dir: &std::path::Path) -> Endpoint {
    Endpoint::new("data_test_pipe")
        .expect("endpoint should be valid")
        .in_directory(dir)
}

pub async fn next_event<T>(events: &mut Events<T>) -> Event<T> {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event should arrive in time")
        .expect("event stream should stay open")
}

/// Next received message, skipping connection life-cycle events.
pub async fn next_message<T: Debug>(events: &mut Events<T>) -> (ConnectionId, T) {
    loop {
        match next_event(events).await {
            Event::MessageReceived {
                connection,
                message,
            } => return (connection, message),
            Event::Connected { .. } | Event::Disconnected { .. } => continue,
            Event::ExceptionOccurred { connection, error } => {
                panic!("unexpected exception on {connection:?}: {error}")
            }
        }
    }
}

pub async fn next_connected<T: Debug>(events: &mut Events<T>) -> ConnectionId {
    loop {
        match next_event(events).await {
            Event::Connected { connection } => return connection,
            Event::Disconnected { .. } => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should become true in time");
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
