use crate::events::{emit, EventPing, EventPingFailed, EventStarted, EventSummary};
use ruvmail_transport::{PeerId, RuvNode, SecureConnection};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub struct PingConfig {
    pub target: PeerId,
    pub count: u32,
    pub delay_ms: u64,
    pub payload_size: usize,
}

pub async fn run(node: RuvNode, config: PingConfig, start: Instant) -> anyhow::Result<()> {
    emit(&EventStarted::new(&node.id().to_string(), "ping"));
    eprintln!("Ping mode -> target: {}", config.target);

    let ping_timeout = Duration::from_secs(10);
    let mut rtts = Vec::new();
    let mut connections = HashSet::new();

    for seq in 1..=config.count {
        if seq > 1 {
            tokio::time::sleep(Duration::from_millis(config.delay_ms)).await;
        }

        let sent_at = Instant::now();
        let attempt = tokio::time::timeout(ping_timeout, ping_once(&node, &config, seq)).await;
        match attempt {
            Ok(Ok((connection, path_rtt))) => {
                let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                connections.insert(connection);
                rtts.push(rtt_ms);
                emit(&EventPing {
                    event: "ping",
                    seq,
                    rtt_ms,
                    path_rtt_ms: path_rtt.as_secs_f64() * 1000.0,
                    connection,
                    elapsed_s: start.elapsed().as_secs_f64(),
                });
            }
            Ok(Err(e)) => emit(&EventPingFailed {
                event: "ping_failed",
                seq,
                error: e.to_string(),
                elapsed_s: start.elapsed().as_secs_f64(),
            }),
            Err(_) => emit(&EventPingFailed {
                event: "ping_failed",
                seq,
                error: format!("no echo within {ping_timeout:?}"),
                elapsed_s: start.elapsed().as_secs_f64(),
            }),
        }
    }

    let summary = EventSummary::from_rtts(config.count, &rtts, connections.len());
    eprintln!(
        "\n{}/{} pings answered, avg {:.2} ms over {} connection(s)",
        summary.received, summary.sent, summary.avg_rtt_ms, summary.connections
    );
    emit(&summary);

    node.shutdown().await?;
    Ok(())
}

/// One ping: a fresh stream, the payload out, the echo back. Returns the id
/// of the connection that carried it and that connection's own RTT estimate.
async fn ping_once(
    node: &RuvNode,
    config: &PingConfig,
    seq: u32,
) -> anyhow::Result<(usize, Duration)> {
    let mut stream = node.dial_peer(config.target).await?;
    let mut payload = vec![b'.'; config.payload_size.max(4)];
    payload[..4].copy_from_slice(&seq.to_be_bytes());

    stream.write_all(&payload).await?;
    stream.shutdown().await?;

    let mut echo = Vec::with_capacity(payload.len());
    stream.read_to_end(&mut echo).await?;
    if echo != payload {
        anyhow::bail!("echo mismatch: sent {} bytes, got {}", payload.len(), echo.len());
    }
    let conn = stream.connection();
    Ok((conn.stable_id(), conn.rtt()))
}
