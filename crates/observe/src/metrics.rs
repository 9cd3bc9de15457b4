//! Global prometheus registry and the `/metrics` + `/liveness` endpoints.

use prometheus::Encoder;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, sync::OnceLock};
use tokio::task::JoinHandle;
use warp::{Filter, Rejection, Reply};

/// Registry shared by every metric struct in the process.
static REGISTRY: OnceLock<prometheus_metric_storage::StorageRegistry> = OnceLock::new();

/// Installs the process-wide registry, optionally prefixing all metric names
/// and attaching constant labels.
///
/// Must run at the top of `main`, before the first metric struct is touched;
/// a second call panics.
pub fn setup_registry(prefix: Option<String>, labels: Option<HashMap<String, String>>) {
    let registry = prometheus::Registry::new_custom(prefix, labels).unwrap();
    let storage_registry = prometheus_metric_storage::StorageRegistry::new(registry);
    REGISTRY.set(storage_registry).unwrap();
}

/// Like [`setup_registry`], but later calls are ignored. Useful for tests.
pub fn setup_registry_reentrant(prefix: Option<String>, labels: Option<HashMap<String, String>>) {
    let registry = prometheus::Registry::new_custom(prefix, labels).unwrap();
    let storage_registry = prometheus_metric_storage::StorageRegistry::new(registry);
    REGISTRY.set(storage_registry).ok();
}

pub fn get_registry() -> &'static prometheus::Registry {
    get_storage_registry().registry()
}

/// The storage registry, self-initializing with defaults so unit tests can
/// touch metrics without any bootstrap.
pub fn get_storage_registry() -> &'static prometheus_metric_storage::StorageRegistry {
    REGISTRY.get_or_init(prometheus_metric_storage::StorageRegistry::default)
}

pub fn encode(registry: &prometheus::Registry) -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Liveness decided by the owning service, typically recency of the last
/// processed auction.
#[async_trait::async_trait]
pub trait LivenessChecking: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Serves `/metrics` and `/liveness` on the given address.
pub fn serve_metrics(liveness: Arc<dyn LivenessChecking>, address: SocketAddr) -> JoinHandle<()> {
    let filter = handle_metrics().or(handle_liveness(liveness));
    tracing::info!(%address, "serving metrics");
    tokio::task::spawn(warp::serve(filter).bind(address))
}

fn handle_metrics() -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let registry = get_registry();
    warp::path("metrics").map(move || encode(registry))
}

fn handle_liveness(
    liveness: Arc<dyn LivenessChecking>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("liveness").and_then(move || {
        let liveness = liveness.clone();
        async move {
            let status = if liveness.is_alive().await {
                warp::http::StatusCode::OK
            } else {
                warp::http::StatusCode::SERVICE_UNAVAILABLE
            };
            Result::<_, std::convert::Infallible>::Ok(warp::reply::with_status(
                warp::reply(),
                status,
            ))
        }
    })
}
