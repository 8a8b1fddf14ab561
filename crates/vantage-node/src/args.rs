use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "vantage-node", about = "Per-node logs, profiles and metrics with cluster-wide queries")]
pub struct Args {
    #[arg(long, env = "VANTAGE_LISTEN_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    /// Unique id of this node in the cluster.
    #[arg(long, env = "VANTAGE_NODE_ID", default_value = "node-1")]
    pub node_id: String,

    /// Address peers use to reach this node (registered in etcd).
    #[arg(long, env = "VANTAGE_ADVERTISE_ADDR", default_value = "127.0.0.1")]
    pub advertise_addr: String,

    /// Port peers are contacted on, unless a peer entry carries its own.
    #[arg(long, env = "VANTAGE_SERVICE_PORT", default_value_t = 18090)]
    pub service_port: u16,

    #[arg(long, env = "VANTAGE_SERVICE_SCHEME", default_value = "http")]
    pub service_scheme: String,

    /// Static peers as `id=ip:port,...`. Ignored when an etcd endpoint is set.
    #[arg(long, env = "VANTAGE_PEERS", default_value = "")]
    pub peers: String,

    #[arg(long, env = "VANTAGE_ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    #[arg(long, env = "VANTAGE_ETCD_PREFIX", default_value = "/vantage")]
    pub etcd_prefix: String,

    #[arg(long, env = "VANTAGE_MEMBERSHIP_TTL_SECS", default_value_t = 10)]
    pub membership_ttl_secs: u64,

    /// Budget for requests that carry no timeout or deadline header.
    #[arg(long, env = "VANTAGE_DEFAULT_TIMEOUT_MS", default_value_t = 60_000)]
    pub default_timeout_ms: u64,

    /// Upper bound on any requested budget.
    #[arg(long, env = "VANTAGE_MAX_TIMEOUT_MS", default_value_t = 300_000)]
    pub max_timeout_ms: u64,

    #[arg(long, env = "VANTAGE_WARN_THRESHOLD", default_value_t = 0.3)]
    pub warn_threshold: f64,

    #[arg(long, env = "VANTAGE_ERROR_THRESHOLD", default_value_t = 0.9)]
    pub error_threshold: f64,

    #[arg(long, env = "VANTAGE_RETRY_IMMEDIATE", default_value_t = 2)]
    pub retry_immediate: u32,

    #[arg(long, env = "VANTAGE_RETRY_UNCLASSIFIED", default_value_t = 2)]
    pub retry_unclassified: u32,

    #[arg(long, env = "VANTAGE_RETRY_INITIAL_DELAY_MS", default_value_t = 10)]
    pub retry_initial_delay_ms: u64,

    #[arg(long, env = "VANTAGE_RETRY_MAX_DELAY_MS", default_value_t = 5_000)]
    pub retry_max_delay_ms: u64,

    #[arg(long, env = "VANTAGE_PEER_CONNECT_TIMEOUT_MS", default_value_t = 3_000)]
    pub peer_connect_timeout_ms: u64,

    /// Token presented to peers with auth enabled.
    #[arg(long, env = "VANTAGE_PEER_TOKEN")]
    pub peer_token: Option<String>,

    /// Records kept per log appender.
    #[arg(long, env = "VANTAGE_LOG_CAPACITY", default_value_t = 10_000)]
    pub log_capacity: usize,

    /// Sample trees kept per profile label.
    #[arg(long, env = "VANTAGE_PROFILE_CAPACITY", default_value_t = 1_000)]
    pub profile_capacity: usize,

    /// Largest `limit` a query may ask for; larger values are capped with a warning.
    #[arg(long, env = "VANTAGE_MAX_LIMIT", default_value_t = 10_000)]
    pub max_limit: i64,

    #[arg(long, env = "VANTAGE_METRICS_INTERVAL_SECS", default_value_t = 10)]
    pub metrics_interval_secs: u64,

    #[arg(long, env = "VANTAGE_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    #[arg(long, env = "VANTAGE_OTLP_URL")]
    pub otlp_url: Option<String>,

    #[arg(long, env = "VANTAGE_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
