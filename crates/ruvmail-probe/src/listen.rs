use crate::events::{emit, EventEcho, EventStarted};
use ruvmail_transport::{RuvNode, RuvStream, RuvTransportError};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on one echoed request.
const MAX_REQUEST: u64 = 1024 * 1024;

pub async fn run(node: RuvNode, start: Instant) -> anyhow::Result<()> {
    let my_id = node.id();
    emit(&EventStarted::new(&my_id.to_string(), "listen"));
    eprintln!("Listening as {my_id}");
    eprintln!("Press Ctrl+C to stop.\n");

    let listener = node.listener();
    let mut count: u64 = 0;
    loop {
        let stream = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nCtrl+C received, shutting down...");
                break;
            }
            res = listener.accept() => match res {
                Ok(stream) => stream,
                Err(RuvTransportError::Shutdown) => break,
                Err(e) => {
                    eprintln!("accept error: {e}");
                    break;
                }
            },
        };

        count += 1;
        tokio::spawn(async move {
            let from = stream.remote_addr();
            let addr = stream.connection().remote_address();
            match echo(stream).await {
                Ok(bytes) => emit(&EventEcho {
                    event: "echo",
                    from: from.to_string(),
                    addr: addr.to_string(),
                    bytes,
                    elapsed_s: start.elapsed().as_secs_f64(),
                }),
                Err(e) => eprintln!("echo to {from} failed: {e}"),
            }
        });
    }

    eprintln!("echoed {count} streams total.");
    node.shutdown().await?;
    Ok(())
}

/// Read the request to its end and write it back.
async fn echo(mut stream: RuvStream) -> std::io::Result<usize> {
    let mut request = Vec::new();
    (&mut stream).take(MAX_REQUEST).read_to_end(&mut request).await?;
    stream.write_all(&request).await?;
    stream.shutdown().await?;
    Ok(request.len())
}
