// ABOUTME: lavawire node monitor binary
// ABOUTME: Connects to one node, logs its events and stats, optionally runs a track search

use clap::Parser;
use lavawire::cli::NodeArgs;
use lavawire::{Cluster, ClusterEvent, IncomingMessage, NodeEvent, UpdateVoiceStatus};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "lavawire")]
#[command(author, version, about = "Monitor a Lavalink-style audio node", long_about = None)]
struct Args {
    #[command(flatten)]
    node: NodeArgs,

    /// Seconds between node health reports
    #[arg(long, default_value = "30")]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    args.node.init_tracing();
    args.node.log_startup_info();

    // The monitor never joins voice channels, so gateway payloads are only logged
    let cluster = Cluster::new(
        args.node.build_config(),
        |guild_id: u64, payload: UpdateVoiceStatus| {
            tracing::debug!("gateway payload for guild {}: {:?}", guild_id, payload);
        },
    );

    let mut events = cluster.subscribe();
    cluster.init(None)?;

    let mut report = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    let mut search = args.node.search.clone();

    tracing::info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(ClusterEvent { node, event }) = event else { break };
                match event {
                    NodeEvent::Connect { took, reconnect } => {
                        tracing::info!(
                            "[{}] connected in {:?}{}",
                            node,
                            took,
                            if reconnect { " (reconnect)" } else { "" }
                        );
                        if let Some(query) = search.take() {
                            run_search(&cluster, &query).await;
                        }
                    }
                    NodeEvent::Disconnect { code, reason, reconnecting } => {
                        tracing::warn!(
                            "[{}] disconnected: code={:?} reason={:?} reconnecting={}",
                            node,
                            code,
                            reason,
                            reconnecting
                        );
                    }
                    NodeEvent::GaveUp { attempts } => {
                        tracing::error!("[{}] gave up after {} attempts", node, attempts);
                        break;
                    }
                    NodeEvent::Error(e) => tracing::error!("[{}] {}", node, e),
                    NodeEvent::Debug(line) => tracing::debug!("[{}] {}", node, line),
                    NodeEvent::Message(IncomingMessage::Stats(stats)) => {
                        tracing::debug!(
                            "[{}] stats: players={} playing={} load={:.2}",
                            node,
                            stats.players,
                            stats.playing_players,
                            stats.cpu.system_load
                        );
                    }
                    NodeEvent::Message(_) => {}
                }
            }
            _ = report.tick() => {
                for node in cluster.nodes() {
                    tracing::info!(
                        "[{}] state={} penalty={:.2} latency={:?} players={}",
                        node.id(),
                        node.connection().state(),
                        node.penalty(),
                        node.connection().latency(),
                        node.stats().players
                    );
                }
            }
        }
    }

    for node in cluster.nodes() {
        if let Err(e) = node.disconnect().await {
            tracing::warn!("[{}] disconnect failed: {}", node.id(), e);
        }
    }
    Ok(())
}

async fn run_search(cluster: &Cluster, query: &str) {
    let rest = match cluster.rest() {
        Ok(rest) => rest,
        Err(e) => {
            tracing::error!("search unavailable: {}", e);
            return;
        }
    };

    let identifier = if query.starts_with("http://") || query.starts_with("https://") {
        query.to_string()
    } else {
        format!("ytsearch:{}", query)
    };

    match rest.load_tracks(&identifier).await {
        Ok(response) => {
            tracing::info!(
                "search '{}': {:?}, {} track(s)",
                query,
                response.load_type,
                response.tracks.len()
            );
            for track in response.tracks.iter().take(5) {
                tracing::info!(
                    "  - {} by {} ({}s)",
                    track.info.title,
                    track.info.author,
                    track.info.length / 1000
                );
            }
        }
        Err(e) => tracing::error!("search '{}' failed: {}", query, e),
    }
}
