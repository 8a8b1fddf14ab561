use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use vantage_cluster::HttpTransport;
use vantage_common::auth::AuthConfig;
use vantage_common::{
    DiagnosticsSink, LogLevel, LogRecord, MetricSample, NetworkService, PeerAddr, RequestSummary,
    SampleNode, PROFILE_DETAIL,
};
use vantage_meta::StaticMembership;
use vantage_node::log_store::LogStore;
use vantage_node::{router, AppState, AppStateBuilder};
use vantage_retry::RetryPolicy;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct Node {
    base: String,
    st: AppState,
}

fn record(origin: &str, secs: i64, message: &str) -> LogRecord {
    LogRecord {
        origin: origin.to_string(),
        trace_id: None,
        ts: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        level: LogLevel::Info,
        logger: "test".to_string(),
        message: message.to_string(),
        attrs: Default::default(),
        stack_samples: Vec::new(),
    }
}

fn peer(node_id: &str, port: u16) -> PeerAddr {
    PeerAddr {
        node_id: node_id.to_string(),
        addr: LOCALHOST,
        port: Some(port),
    }
}

/// Starts `n` nodes named `n0..` that all know each other, plus any `extra`
/// peers. `configure` customises node `i`'s state.
async fn spawn_cluster<F>(n: usize, extra: Vec<PeerAddr>, configure: F) -> Vec<Node>
where
    F: Fn(usize, AppStateBuilder) -> AppStateBuilder,
{
    let mut listeners = Vec::new();
    for _ in 0..n {
        listeners.push(TcpListener::bind((LOCALHOST, 0)).await.unwrap());
    }
    let mut peers: BTreeSet<PeerAddr> = listeners
        .iter()
        .enumerate()
        .map(|(i, l)| peer(&format!("n{i}"), l.local_addr().unwrap().port()))
        .collect();
    peers.extend(extra);

    let mut nodes = Vec::new();
    for (i, listener) in listeners.into_iter().enumerate() {
        let node_id = format!("n{i}");
        let membership = StaticMembership::new(&node_id, peers.clone(), NetworkService::http(0));
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let builder = AppState::builder(node_id, Arc::new(LogStore::new(1000)));
        let st = configure(i, builder).build(
            Arc::new(membership),
            Arc::new(transport),
            RetryPolicy::default(),
        );
        let base = format!("http://{}", listener.local_addr().unwrap());
        let app = router(st.clone());
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        nodes.push(Node { base, st });
    }
    nodes
}

async fn plain_cluster(n: usize) -> Vec<Node> {
    spawn_cluster(n, Vec::new(), |_, b| b).await
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn get_json(url: &str) -> (u16, Value) {
    let resp = client().get(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

fn seconds(body: &Value) -> Vec<i64> {
    body.as_array()
        .unwrap()
        .iter()
        .map(|r| {
            chrono::DateTime::parse_from_rfc3339(r["ts"].as_str().unwrap())
                .unwrap()
                .timestamp()
                - 1_700_000_000
        })
        .collect()
}

fn seed_interleaved(nodes: &[Node]) {
    // n0: 1 4 7, n1: 2 5 8, n2: 3 6 9
    for (i, node) in nodes.iter().enumerate() {
        for k in 0..3 {
            let secs = (i as i64 + 1) + 3 * k;
            node.st.logs.append(record(&format!("n{i}"), secs, "seeded"));
        }
    }
}

#[tokio::test]
async fn test_cluster_logs_merge_in_requested_order() {
    let nodes = plain_cluster(3).await;
    seed_interleaved(&nodes);
    let filter = urlencoding::encode("message == \"seeded\"").into_owned();

    let (status, body) = get_json(&format!(
        "{}/logs/cluster?limit=4&filter={filter}",
        nodes[0].base
    ))
    .await;
    assert_eq!(status, 200);
    assert_eq!(seconds(&body), vec![9, 8, 7, 6]);

    let (status, body) = get_json(&format!(
        "{}/logs/cluster?limit=4&order=ASC&filter={filter}",
        nodes[1].base
    ))
    .await;
    assert_eq!(status, 200);
    assert_eq!(seconds(&body), vec![1, 2, 3, 4]);

    let origins: BTreeSet<String> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["origin"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(origins.len(), 3);
}

#[tokio::test]
async fn test_cluster_logs_limit_bounds() {
    let nodes = plain_cluster(2).await;
    seed_interleaved(&nodes);

    let (status, body) = get_json(&format!("{}/logs/cluster?limit=0", nodes[0].base)).await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::Array(Vec::new()));

    let (status, body) = get_json(&format!("{}/logs/cluster?limit=-1", nodes[0].base)).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["type"], "bad_request");

    let (status, _) = get_json(&format!("{}/logs/local?limit=-1", nodes[0].base)).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_limit_above_maximum_is_capped_with_warning() {
    let nodes = spawn_cluster(1, Vec::new(), |_, b| b.max_limit(2)).await;
    seed_interleaved(&nodes);

    let resp = client()
        .get(format!("{}/logs/local?limit=50", nodes[0].base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let warning = resp.headers()["warning"].to_str().unwrap().to_string();
    assert!(warning.starts_with("299 vantage"), "{warning}");
    assert!(warning.contains("capped to 2"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_malformed_request_metadata_is_rejected() {
    let nodes = plain_cluster(1).await;

    let resp = client()
        .get(format!("{}/logs/local", nodes[0].base))
        .header("x-timeout", "soon")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (status, _) = get_json(&format!("{}/logs/local?_x-timeout=bogus", nodes[0].base)).await;
    assert_eq!(status, 400);

    let resp = client()
        .get(format!("{}/logs/local", nodes[0].base))
        .header("x-log-level", "loud")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (status, _) = get_json(&format!("{}/logs/local?filter=level%20%3E%3E", nodes[0].base)).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let nodes = plain_cluster(1).await;
    let resp = client()
        .get(format!("{}/logs/local", nodes[0].base))
        .header("x-request-id", "req-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "req-123");

    let resp = client()
        .get(format!("{}/logs/local", nodes[0].base))
        .send()
        .await
        .unwrap();
    assert!(!resp.headers()["x-request-id"].is_empty());
}

#[derive(Default)]
struct Summaries(Mutex<Vec<RequestSummary>>);

impl DiagnosticsSink for Summaries {
    fn emit(&self, summary: &RequestSummary) {
        self.0.lock().unwrap().push(summary.clone());
    }
}

impl Summaries {
    fn attribute(&self, name: &str, attribute: &str) -> Option<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.attributes.iter().find(|a| a.name == attribute))
            .map(|a| a.value.clone())
    }
}

#[tokio::test]
async fn test_summary_records_client_and_byte_counts() {
    let summaries = Arc::new(Summaries::default());
    let writer = summaries.clone();
    let nodes = spawn_cluster(2, Vec::new(), move |_, b| b.writer(writer.clone())).await;
    for (i, node) in nodes.iter().enumerate() {
        node.st.logs.append(record(&format!("n{i}"), i as i64, "hello"));
    }

    let body = client()
        .get(format!("{}/logs/local", nodes[0].base))
        .header("x-forwarded-for", "10.1.2.3")
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let name = "GET /logs/local";
    assert_eq!(
        summaries.attribute(name, "clientHost"),
        Some(Value::from("10.1.2.3,127.0.0.1"))
    );
    assert_eq!(summaries.attribute(name, "inBytes"), Some(Value::from(0)));
    assert_eq!(summaries.attribute(name, "outBytes"), Some(Value::from(body.len())));

    let text = client()
        .get(format!("{}/logs/cluster", nodes[1].base))
        .header("accept", "text/plain")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text.lines().count(), 2);
    assert_eq!(
        summaries.attribute("GET /logs/cluster", "outBytes"),
        Some(Value::from(text.len()))
    );
}

#[tokio::test]
async fn test_cluster_logs_stream_as_text() {
    let nodes = plain_cluster(3).await;
    seed_interleaved(&nodes);
    let filter = urlencoding::encode("message == \"seeded\"").into_owned();

    let resp = client()
        .get(format!("{}/logs/cluster?limit=5&filter={filter}", nodes[2].base))
        .header("accept", "text/plain")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = resp.text().await.unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 5);
    assert!(lines.iter().all(|l| l.contains("seeded")));
}

#[tokio::test]
async fn test_unreachable_peer_fails_with_deadline_exceeded() {
    // Bound and released: connections to it are refused, which is transient.
    let dead = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let nodes = spawn_cluster(1, vec![peer("gone", dead_port)], |_, b| b).await;
    let resp = client()
        .get(format!("{}/logs/cluster?limit=3", nodes[0].base))
        .header("x-timeout", "300ms")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 504);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "deadline_exceeded");
}

#[tokio::test]
async fn test_rejecting_peer_fails_the_whole_query() {
    let nodes = spawn_cluster(2, Vec::new(), |i, b| {
        if i == 1 {
            b.auth(AuthConfig::from_tokens("secret:operator"))
        } else {
            b
        }
    })
    .await;
    seed_interleaved(&nodes);

    let (status, body) = get_json(&format!("{}/logs/cluster?limit=3", nodes[0].base)).await;
    assert_eq!(status, 502);
    assert_eq!(body["error"]["type"], "participant_failed");
    assert!(body["error"]["message"].as_str().unwrap().contains("peer:n1"));
}

#[tokio::test]
async fn test_auth_roles() {
    let nodes = spawn_cluster(1, Vec::new(), |_, b| {
        b.auth(AuthConfig::from_tokens("op:operator,view:viewer"))
    })
    .await;
    let base = &nodes[0].base;

    let resp = client().get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = client().get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client().get(format!("{base}/logs/local")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let resp = client()
        .get(format!("{base}/logs/local"))
        .bearer_auth("view")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let resp = client()
        .get(format!("{base}/logs/local"))
        .bearer_auth("op")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn test_cluster_profiles() {
    let nodes = plain_cluster(3).await;
    let now = Utc::now();
    for (i, node) in nodes.iter().enumerate() {
        let mut tree = SampleNode::new();
        tree.add_path(&["scan"], (i as u64) + 1);
        node.st.profiles.record("GET /custom", now, tree);
        node.st
            .profiles
            .record(&format!("only-n{i}"), now, {
                let mut t = SampleNode::new();
                t.add_path(&["x"], 1);
                t
            });
    }

    let (status, body) = get_json(&format!("{}/profiles/cluster/groups", nodes[0].base)).await;
    assert_eq!(status, 200);
    let labels: BTreeSet<String> = serde_json::from_value(body).unwrap();
    for expected in ["GET /custom", "only-n0", "only-n1", "only-n2"] {
        assert!(labels.contains(expected), "missing {expected} in {labels:?}");
    }

    let (status, body) = get_json(&format!(
        "{}/profiles/cluster/groups/GET%20%2Fcustom",
        nodes[1].base
    ))
    .await;
    assert_eq!(status, 200);
    let tree: SampleNode = serde_json::from_value(body).unwrap();
    assert_eq!(tree.count, 6);
    assert_eq!(tree.children["scan"].count, 6);

    let (status, body) = get_json(&format!("{}/profiles/local/groups/nothing-here", nodes[0].base)).await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_trace_profile_merges_profile_detail_records() {
    let nodes = plain_cluster(3).await;
    for (i, node) in nodes.iter().enumerate().skip(1) {
        let mut tree = SampleNode::new();
        tree.add_path(&["fan_out", "peer:n0"], 10 * i as u64);
        let mut rec = record(&format!("n{i}"), i as i64, PROFILE_DETAIL);
        rec.trace_id = Some("trace-42".to_string());
        rec.stack_samples = tree.flatten();
        node.st.logs.append(rec);
        node.st.logs.append(record(&format!("n{i}"), 50, "noise"));
    }

    let (status, body) = get_json(&format!("{}/profiles/cluster/traces/trace-42", nodes[0].base)).await;
    assert_eq!(status, 200);
    let tree: SampleNode = serde_json::from_value(body).unwrap();
    assert_eq!(tree.count, 30);
    assert_eq!(tree.children["fan_out"].children["peer:n0"].count, 30);
}

#[tokio::test]
async fn test_cluster_metrics() {
    let nodes = plain_cluster(2).await;
    let t0 = Utc::now();
    let mut values = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for k in 0..3i64 {
            let ts = t0 + chrono::Duration::seconds(2 * k + i as i64);
            let value = (10 * i as i64 + k) as f64;
            values.insert(ts.timestamp(), value);
            node.st.metrics.push(MetricSample {
                node: format!("n{i}"),
                ts,
                name: "queue_depth".to_string(),
                value,
            });
        }
    }

    let (status, body) = get_json(&format!("{}/metrics/cluster", nodes[0].base)).await;
    assert_eq!(status, 200);
    let names: BTreeSet<String> = serde_json::from_value(body).unwrap();
    assert!(names.contains("queue_depth"));

    let (status, body) = get_json(&format!("{}/metrics/cluster/queue_depth?limit=3", nodes[0].base)).await;
    assert_eq!(status, 200);
    let samples: Vec<MetricSample> = serde_json::from_value(body).unwrap();
    let offsets: Vec<i64> = samples.iter().map(|s| (s.ts - t0).num_seconds()).collect();
    assert_eq!(offsets, vec![5, 4, 3]);
    assert_eq!(samples[0].node, "n1");
    assert_eq!(samples[0].value, values[&samples[0].ts.timestamp()]);
}
