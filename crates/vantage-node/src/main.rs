use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::Layer;
use vantage_cluster::HttpTransport;
use vantage_common::auth::AuthConfig;
use vantage_common::{NetworkService, PeerAddr};
use vantage_meta::{parse_peers, EtcdMembership, Membership, StaticMembership};
use vantage_node::args::Args;
use vantage_node::capture::CaptureLayer;
use vantage_node::log_store::LogStore;
use vantage_node::metrics::snapshot_loop;
use vantage_node::state::retry_policy;
use vantage_node::AppState;

/// `EX_SOFTWARE`: the process stopped on a non-recoverable request failure.
const EXIT_FATAL: i32 = 70;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let logs = Arc::new(LogStore::new(args.log_capacity));
    let otel_provider = vantage_common::telemetry::init_tracing(
        "vantage-node",
        &args.log_format,
        args.otlp_url.as_deref(),
        args.otlp_token.as_deref(),
        vec![CaptureLayer::new(args.node_id.clone(), logs.clone()).boxed()],
    );

    let shutdown = CancellationToken::new();
    let http_service = NetworkService {
        scheme: args.service_scheme.clone(),
        port: args.service_port,
    };

    let membership: Arc<dyn Membership> = match args.etcd_endpoint.as_deref() {
        Some(endpoint) => {
            let addr: IpAddr = args
                .advertise_addr
                .parse()
                .with_context(|| format!("invalid advertise address '{}'", args.advertise_addr))?;
            let local = PeerAddr {
                node_id: args.node_id.clone(),
                addr,
                port: Some(args.service_port),
            };
            let etcd = EtcdMembership::connect(
                &[endpoint.to_string()],
                &args.etcd_prefix,
                local,
                http_service,
                Duration::from_secs(args.membership_ttl_secs),
            )
            .await?;
            etcd.register().await?;
            let _heartbeat = etcd.spawn_heartbeat(shutdown.clone());
            Arc::new(etcd)
        }
        None => {
            let peers = parse_peers(&args.peers)?;
            tracing::info!(peers = peers.len(), "using static membership");
            Arc::new(StaticMembership::new(&args.node_id, peers, http_service))
        }
    };

    let transport = HttpTransport::new(Duration::from_millis(args.peer_connect_timeout_ms))
        .context("failed to build peer http client")?
        .with_auth_token(args.peer_token.clone());

    let st = AppState::builder(args.node_id.clone(), logs)
        .from_args(&args)
        .auth(AuthConfig::from_env())
        .build(membership, Arc::new(transport), retry_policy(&args));
    tracing::info!(policy = ?st.aggregator.policy(), "retry policy");

    tokio::spawn(snapshot_loop(
        st.clone(),
        Duration::from_secs(args.metrics_interval_secs),
        shutdown.clone(),
    ));

    let fatal = st.fatal.clone();
    let app = vantage_node::router(st);
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(listen_addr = %args.listen_addr, node_id = %args.node_id, "vantage node listening");

    let drain = fatal.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = drain.cancelled() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        })
        .await?;
    shutdown.cancel();

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush OTLP spans: {e}");
        }
    }
    if fatal.is_cancelled() {
        std::process::exit(EXIT_FATAL);
    }
    Ok(())
}
