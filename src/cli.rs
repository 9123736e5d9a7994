// ABOUTME: Shared CLI argument parsing for the node monitor binary
// ABOUTME: Turns command-line flags and environment variables into a ClusterConfig

use crate::config::{ClusterConfig, NodeConfig, ReconnectPolicy, ResumingOptions};
use clap::Args;

/// Node connection arguments
///
/// Use with `#[command(flatten)]` in a binary's Args struct:
/// ```ignore
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     node: NodeArgs,
/// }
/// ```
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Node host
    #[arg(long, env = "LAVAWIRE_HOST", default_value = "localhost")]
    pub host: String,

    /// Node port
    #[arg(short, long, env = "LAVAWIRE_PORT", default_value = "2333")]
    pub port: u16,

    /// Node password
    #[arg(long, env = "LAVAWIRE_PASSWORD", default_value = "youshallnotpass")]
    pub password: String,

    /// Use wss:// and https://
    #[arg(long)]
    pub secure: bool,

    /// Bot user id
    #[arg(short, long, env = "LAVAWIRE_USER_ID")]
    pub user_id: u64,

    /// Identifier for the node in logs and events
    #[arg(long, default_value = "main")]
    pub node_id: String,

    /// Resume key; a random one is generated when `--resume` is set without a key
    #[arg(long)]
    pub resume_key: Option<String>,

    /// Enable session resuming
    #[arg(long)]
    pub resume: bool,

    /// Reconnect attempts before giving up (0 disables reconnecting)
    #[arg(long, default_value = "3")]
    pub max_tries: u32,

    /// Search query run against the node once it is connected
    #[arg(short, long)]
    pub search: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl NodeArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "lavawire=debug"
        } else {
            "lavawire=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self) {
        tracing::info!("lavawire monitor v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Node: {} at {}:{}", self.node_id, self.host, self.port);
        tracing::info!("User: {}", self.user_id);
    }

    /// Build the single-node ClusterConfig described by these args
    pub fn build_config(&self) -> ClusterConfig {
        let mut node = NodeConfig::new(&self.node_id, &self.host, self.port, &self.password)
            .secure(self.secure);

        node = if self.max_tries == 0 {
            node.no_reconnect()
        } else {
            node.reconnect(ReconnectPolicy::exponential().max_tries(Some(self.max_tries)))
        };

        let resuming = match (&self.resume_key, self.resume) {
            (Some(key), _) => Some(ResumingOptions::new(key.clone())),
            (None, true) => Some(ResumingOptions::generated()),
            (None, false) => None,
        };
        if let Some(resuming) = resuming {
            node = node.resuming(resuming);
        }

        ClusterConfig::new().node(node).user_id(self.user_id)
    }
}
