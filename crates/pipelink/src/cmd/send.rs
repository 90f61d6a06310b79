use std::fs;
use std::time::Duration;

use bytes::Bytes;
use pipelink_peer::{CancellationToken, Client, ClientConfig, ConnectionId, Event, Events};
use tracing::debug;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;
    let config = ClientConfig::new(args.endpoint.resolve()?)
        .without_reconnect()
        .with_connect_timeout(connect_timeout);
    let (client, mut events) = Client::raw(config);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = exchange(&client, &mut events, &payload, &args, wait_timeout, &cancel).await;
    watcher.abort();
    client.disconnect().await;

    let reply = result?;
    if let Some((connection, message)) = reply {
        print_message(connection, &message, format);
    }
    Ok(SUCCESS)
}

async fn exchange(
    client: &Client<Bytes>,
    events: &mut Events<Bytes>,
    payload: &[u8],
    args: &SendArgs,
    wait_timeout: Duration,
    cancel: &CancellationToken,
) -> CliResult<Option<(ConnectionId, Bytes)>> {
    client
        .connect(cancel)
        .await
        .map_err(|err| peer_error("connect failed", err))?;
    client
        .write_raw(payload, cancel)
        .await
        .map_err(|err| peer_error("send failed", err))?;
    debug!(size = payload.len(), "message sent");

    if !args.wait {
        return Ok(None);
    }
    let waited = tokio::time::timeout(wait_timeout, async {
        while let Some(event) = events.recv().await {
            if let Some(reply) = reply_from(event) {
                return reply;
            }
        }
        Err(CliError::new(FAILURE, "client closed before a reply arrived"))
    });
    tokio::select! {
        _ = cancel.cancelled() => Err(CliError::new(crate::exit::INTERRUPTED, "interrupted")),
        waited = waited => match waited {
            Ok(reply) => reply.map(Some),
            Err(_) => Err(CliError::new(
                TIMEOUT,
                format!("no reply within {wait_timeout:?}"),
            )),
        },
    }
}

/// What a client event means while waiting for one reply: `None` to keep
/// waiting, else the reply or the reason there will be none.
fn reply_from(event: Event<Bytes>) -> Option<CliResult<(ConnectionId, Bytes)>> {
    match event {
        Event::MessageReceived {
            connection,
            message,
        } => Some(Ok((connection, message))),
        Event::Disconnected { .. } => Some(Err(CliError::new(
            FAILURE,
            "server closed the connection before replying",
        ))),
        Event::ExceptionOccurred {
            connection: Some(_),
            error,
        } => Some(Err(peer_error("receive failed", error))),
        Event::Connected { .. } | Event::ExceptionOccurred { connection: None, .. } => None,
    }
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), &err));
    }
    Ok(Vec::new())
}
