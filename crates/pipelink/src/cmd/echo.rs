use bytes::Bytes;
use pipelink_peer::{CancellationToken, ConnectionId, Event, ErrorKind, PeerError, Server};
use tracing::{debug, info, warn};

use crate::cmd::{session_over, EchoArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};

pub async fn run(args: EchoArgs) -> CliResult<i32> {
    let config = args.serve.server_config()?;
    let endpoint = config.endpoint.clone();
    let (server, mut events) = Server::raw(config);

    let cancel = CancellationToken::new();
    server
        .start(&cancel)
        .await
        .map_err(|err| peer_error("bind failed", err))?;
    info!(endpoint = %endpoint, address = %endpoint.address(), "echo server listening");

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        let event = tokio::select! {
            _ = &mut interrupted => {
                info!("interrupted; stopping server");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        if session_over(args.serve.single, &event) {
            debug!("client gone; single-connection session over");
            break;
        }
        match event {
            Event::MessageReceived {
                connection,
                message,
            } => {
                debug!(connection = %connection, size = message.len(), "echoing message");
                let result = server.write_raw_to(connection, &message, &cancel).await;
                log_echo_failure(connection, &message, result);
            }
            Event::Connected { connection } => info!(connection = %connection, "client connected"),
            Event::Disconnected { connection } => {
                info!(connection = %connection, "client disconnected")
            }
            Event::ExceptionOccurred { connection, error } => {
                warn!(connection = ?connection, error = %error, "connection error")
            }
        }
    }

    server.stop().await;
    Ok(SUCCESS)
}

/// A client that left before its echo was written is routine, not a fault.
fn log_echo_failure(connection: ConnectionId, message: &Bytes, result: Result<(), PeerError>) {
    match result {
        Ok(()) => {}
        Err(err) if is_client_gone(&err) => {
            debug!(connection = %connection, error = %err, "client left before echo")
        }
        Err(err) => warn!(
            connection = %connection,
            size = message.len(),
            error = %err,
            "echo failed"
        ),
    }
}

fn is_client_gone(err: &PeerError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotConnected | ErrorKind::UnknownConnection | ErrorKind::ConnectionFault
    )
}
