use pipelink_peer::{CancellationToken, Event, Server};
use tracing::{debug, info, warn};

use crate::cmd::{session_over, ListenArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.serve.server_config()?;
    let endpoint = config.endpoint.clone();
    let (server, mut events) = Server::raw(config);

    let cancel = CancellationToken::new();
    server
        .start(&cancel)
        .await
        .map_err(|err| peer_error("bind failed", err))?;
    info!(endpoint = %endpoint, address = %endpoint.address(), "listening");

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    let mut printed = 0usize;
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
                print_message(connection, &message, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
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
