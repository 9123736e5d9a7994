// ABOUTME: Node and cluster configuration
// ABOUTME: Builder-style settings for connections, resuming and reconnect policies

use std::time::Duration;

/// Client name reported in the `Client-Name` header by default
pub const DEFAULT_CLIENT_NAME: &str = "lavawire";

/// Session resuming settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResumingOptions {
    /// Key the node uses to identify the resumable session
    pub key: String,
    /// How long the node keeps the session after a disconnect
    pub timeout: Duration,
}

impl ResumingOptions {
    /// Resume with `key` and the default 60 second timeout
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Resume with a random key
    pub fn generated() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// How a connection retries after an unexpected close
#[derive(Clone, Debug, PartialEq)]
pub enum ReconnectPolicy {
    /// Fixed delay between tries
    Basic {
        /// Delay before each try
        delay: Duration,
        /// Give up after this many tries, `None` for unlimited
        max_tries: Option<u32>,
    },
    /// Doubling delay with an upper bound and optional jitter
    Exponential {
        /// First delay
        initial_delay: Duration,
        /// Upper bound on the delay before jitter
        max_delay: Duration,
        /// Jitter factor in `[0, 1)`
        randomization_factor: f64,
        /// Give up after this many tries, `None` for unlimited
        max_tries: Option<u32>,
    },
}

impl ReconnectPolicy {
    /// 10 second fixed delay, 3 tries
    pub fn basic() -> Self {
        ReconnectPolicy::Basic {
            delay: Duration::from_secs(10),
            max_tries: Some(3),
        }
    }

    /// 100ms doubling up to 10 seconds, no jitter, 3 tries
    pub fn exponential() -> Self {
        ReconnectPolicy::Exponential {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            randomization_factor: 0.0,
            max_tries: Some(3),
        }
    }

    /// Set the try limit, `None` for unlimited
    pub fn max_tries(mut self, tries: Option<u32>) -> Self {
        match &mut self {
            ReconnectPolicy::Basic { max_tries, .. }
            | ReconnectPolicy::Exponential { max_tries, .. } => *max_tries = tries,
        }
        self
    }

    /// Configured try limit
    pub fn tries(&self) -> Option<u32> {
        match self {
            ReconnectPolicy::Basic { max_tries, .. }
            | ReconnectPolicy::Exponential { max_tries, .. } => *max_tries,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

/// Settings for a single node
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Identifier, unique within a cluster
    pub id: String,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Password sent in the `Authorization` header
    pub password: String,
    /// Use `wss`/`https`
    pub secure: bool,
    /// Session resuming, disabled when `None`
    pub resuming: Option<ResumingOptions>,
    /// Reconnect policy, no reconnects when `None`
    pub reconnect: Option<ReconnectPolicy>,
    /// Value of the `Client-Name` header
    pub client_name: String,
    /// Value of the `Num-Shards` header
    pub num_shards: u32,
    /// Route volume and equalizer changes through the `filters` op
    pub use_filters: bool,
}

impl NodeConfig {
    /// Create a node configuration
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            password: password.into(),
            ..Default::default()
        }
    }

    /// Use TLS
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Enable session resuming
    pub fn resuming(mut self, options: ResumingOptions) -> Self {
        self.resuming = Some(options);
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Disable reconnects
    pub fn no_reconnect(mut self) -> Self {
        self.reconnect = None;
        self
    }

    /// Set the client name
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Set the shard count
    pub fn num_shards(mut self, shards: u32) -> Self {
        self.num_shards = shards;
        self
    }

    /// Toggle filter mode
    pub fn use_filters(mut self, enabled: bool) -> Self {
        self.use_filters = enabled;
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// WebSocket endpoint
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.address())
    }

    /// REST base url
    pub fn http_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.address())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "main".to_string(),
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
            resuming: None,
            reconnect: None,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            num_shards: 1,
            use_filters: false,
        }
    }
}

/// Settings for a cluster of nodes
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    /// Nodes in the cluster
    pub nodes: Vec<NodeConfig>,
    /// Bot user id, may also be supplied to `init`
    pub user_id: Option<u64>,
}

impl ClusterConfig {
    /// Empty cluster configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node
    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    /// Set the bot user id
    pub fn user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}
