use std::sync::Arc;
use std::time::{
    Duration,
    Instant,
};

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{
    Pod,
    Service,
};
use kube::api::{
    Api,
    ListParams,
};
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ForwardError;
use crate::kube::client::ClientFactory;

pub const CLIENT_TTL: Duration = Duration::from_secs(600);
pub const POD_LIST_TTL: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PodListKey {
    pub context: String,
    pub namespace: String,
    pub service: String,
}

/// One running pod usable as a port-forward target.
#[derive(Clone, Debug, PartialEq)]
pub struct PodEndpoint {
    pub pod_name: String,
}

struct CachedClient {
    client: Client,
    created_at: Instant,
}

struct CachedPodList {
    pods: Arc<Vec<PodEndpoint>>,
    created_at: Instant,
}

/// Pooled API clients keyed by context plus TTL-bounded pod-list
/// snapshots keyed by `(context, namespace, service)`. Shared by every
/// kubernetes forwarder so bursty connection rates do not hammer the
/// API server.
pub struct KubeCache {
    factory: Arc<dyn ClientFactory>,
    clients: DashMap<String, CachedClient>,
    pod_lists: DashMap<PodListKey, CachedPodList>,
    client_ttl: Duration,
    pod_list_ttl: Duration,
}

impl KubeCache {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_ttls(factory, CLIENT_TTL, POD_LIST_TTL)
    }

    pub fn with_ttls(
        factory: Arc<dyn ClientFactory>, client_ttl: Duration, pod_list_ttl: Duration,
    ) -> Self {
        Self {
            factory,
            clients: DashMap::new(),
            pod_lists: DashMap::new(),
            client_ttl,
            pod_list_ttl,
        }
    }

    /// Returns the cached client for a context, creating and caching a
    /// fresh one when the entry is missing or expired.
    pub async fn get_client(&self, context: &str) -> Result<Client, ForwardError> {
        if let Some(cached) = self.clients.get(context) {
            if cached.created_at.elapsed() < self.client_ttl {
                return Ok(cached.client.clone());
            }
            drop(cached);
            debug!(context, "client cache entry expired");
            self.clients.remove(context);
        }

        let client = self.factory.create(context).await?;
        self.clients.insert(
            context.to_string(),
            CachedClient {
                client: client.clone(),
                created_at: Instant::now(),
            },
        );
        debug!(context, "created and cached new client");

        Ok(client)
    }

    /// Returns the Running pods selected by the service's label
    /// selector, from cache when fresh. The snapshot preserves the API
    /// server's list order.
    pub async fn get_pods_for_service(
        &self, context: &str, namespace: &str, service: &str,
    ) -> Result<Arc<Vec<PodEndpoint>>, ForwardError> {
        let key = PodListKey {
            context: context.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
        };

        if let Some(cached) = self.pod_lists.get(&key) {
            if cached.created_at.elapsed() < self.pod_list_ttl {
                debug!(context, namespace, service, "pod list cache hit");
                return Ok(cached.pods.clone());
            }
            drop(cached);
            self.pod_lists.remove(&key);
        }

        let client = self.get_client(context).await?;

        let svc_api: Api<Service> = Api::namespaced(client.clone(), namespace);
        let svc = svc_api.get(service).await.map_err(|e| {
            ForwardError::Kubernetes(format!("failed to read service '{service}': {e}"))
        })?;

        let selector = svc.spec.and_then(|spec| spec.selector).ok_or_else(|| {
            ForwardError::Kubernetes(format!("no selector found for service '{service}'"))
        })?;
        let label_selector = selector
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");

        let pod_api: Api<Pod> = Api::namespaced(client, namespace);
        let pods = pod_api
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|e| {
                ForwardError::Kubernetes(format!(
                    "failed to list pods matching '{label_selector}': {e}"
                ))
            })?;

        let running: Vec<PodEndpoint> = pods
            .items
            .iter()
            .filter(|pod| is_running(pod))
            .filter_map(|pod| pod.metadata.name.clone())
            .map(|pod_name| PodEndpoint { pod_name })
            .collect();

        debug!(
            context,
            namespace,
            service,
            pods = running.len(),
            "refreshed pod list snapshot"
        );

        let snapshot = Arc::new(running);
        self.pod_lists.insert(
            key,
            CachedPodList {
                pods: snapshot.clone(),
                created_at: Instant::now(),
            },
        );

        Ok(snapshot)
    }

    pub fn invalidate_pod_cache(&self) {
        self.pod_lists.clear();
    }

    pub fn invalidate_pod_cache_entry(&self, context: &str, namespace: &str, service: &str) {
        self.pod_lists.remove(&PodListKey {
            context: context.to_string(),
            namespace: namespace.to_string(),
            service: service.to_string(),
        });
    }

    pub fn sweep_expired(&self) {
        self.clients
            .retain(|_, cached| cached.created_at.elapsed() < self.client_ttl);
        self.pod_lists
            .retain(|_, cached| cached.created_at.elapsed() < self.pod_list_ttl);
    }

    /// Background sweep removing expired entries from both maps until
    /// cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => cache.sweep_expired(),
                }
            }
        })
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    use async_trait::async_trait;
    use http::{
        Request,
        Response,
    };
    use k8s_openapi::api::core::v1::{
        PodStatus,
        ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::List;
    use kube::client::Body;
    use tower_test::mock;

    use super::*;

    struct MockClientFactory {
        client: Client,
        created: AtomicUsize,
    }

    #[async_trait]
    impl ClientFactory for MockClientFactory {
        async fn create(&self, _context: &str) -> Result<Client, ForwardError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.client.clone())
        }
    }

    fn mock_pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mock_service(selector: BTreeMap<String, String>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("redis".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn serve_service_and_pods(
        handle: &mut mock::Handle<Request<Body>, Response<Body>>, pods: Vec<Pod>,
    ) {
        let (request, send) = handle.next_request().await.expect("service GET expected");
        assert_eq!(request.method(), "GET");
        assert_eq!(
            request.uri().path(),
            "/api/v1/namespaces/test-ns/services/redis"
        );
        let svc = mock_service(
            [("app".to_string(), "redis".to_string())]
                .into_iter()
                .collect(),
        );
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&svc).unwrap()))
                .unwrap(),
        );

        let (request, send) = handle.next_request().await.expect("pod LIST expected");
        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri().path(), "/api/v1/namespaces/test-ns/pods");
        assert!(request
            .uri()
            .query()
            .unwrap()
            .contains("labelSelector=app%3Dredis"));
        let pod_list: List<Pod> = List {
            items: pods,
            ..Default::default()
        };
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&pod_list).unwrap()))
                .unwrap(),
        );
    }

    fn cache_with_mock(pod_list_ttl: Duration) -> (Arc<KubeCache>, mock::Handle<Request<Body>, Response<Body>>) {
        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "test-ns");
        let factory = Arc::new(MockClientFactory {
            client,
            created: AtomicUsize::new(0),
        });
        let cache = Arc::new(KubeCache::with_ttls(factory, CLIENT_TTL, pod_list_ttl));
        (cache, handle)
    }

    #[tokio::test]
    async fn test_pod_list_filters_to_running_and_keeps_order() {
        let (cache, mut handle) = cache_with_mock(POD_LIST_TTL);

        let server = tokio::spawn(async move {
            serve_service_and_pods(
                &mut handle,
                vec![
                    mock_pod("redis-0", "Running"),
                    mock_pod("redis-1", "Pending"),
                    mock_pod("redis-2", "Running"),
                ],
            )
            .await;
        });

        let pods = cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(pods.len(), 2);
        assert_eq!(pods[0].pod_name, "redis-0");
        assert_eq!(pods[1].pod_name, "redis-2");
    }

    #[tokio::test]
    async fn test_pod_list_is_cached_within_ttl() {
        let (cache, mut handle) = cache_with_mock(POD_LIST_TTL);

        let server = tokio::spawn(async move {
            serve_service_and_pods(&mut handle, vec![mock_pod("redis-0", "Running")]).await;
        });

        let first = cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        let second = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_pods_for_service("dev", "test-ns", "redis"),
        )
        .await
        .expect("cached read should not block")
        .unwrap();

        assert_eq!(first, second);
        drop(cache);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_pod_list_refreshes_after_ttl() {
        let (cache, mut handle) = cache_with_mock(Duration::from_millis(50));

        let server = tokio::spawn(async move {
            serve_service_and_pods(&mut handle, vec![mock_pod("redis-0", "Running")]).await;
            serve_service_and_pods(&mut handle, vec![mock_pod("redis-9", "Running")]).await;
        });

        let first = cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        assert_eq!(first[0].pod_name, "redis-0");

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        assert_eq!(second[0].pod_name, "redis-9");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_pod_cache_forces_refetch() {
        let (cache, mut handle) = cache_with_mock(POD_LIST_TTL);

        let server = tokio::spawn(async move {
            serve_service_and_pods(&mut handle, vec![mock_pod("redis-0", "Running")]).await;
            serve_service_and_pods(&mut handle, vec![mock_pod("redis-1", "Running")]).await;
            serve_service_and_pods(&mut handle, vec![mock_pod("redis-2", "Running")]).await;
        });

        cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        cache.invalidate_pod_cache();
        let refreshed = cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        assert_eq!(refreshed[0].pod_name, "redis-1");

        cache.invalidate_pod_cache_entry("dev", "test-ns", "redis");
        let refreshed = cache
            .get_pods_for_service("dev", "test-ns", "redis")
            .await
            .unwrap();
        assert_eq!(refreshed[0].pod_name, "redis-2");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_service_without_selector_is_an_error() {
        let (cache, mut handle) = cache_with_mock(POD_LIST_TTL);

        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("service GET expected");
            let svc = Service {
                metadata: ObjectMeta {
                    name: Some("redis".to_string()),
                    ..Default::default()
                },
                spec: Some(ServiceSpec::default()),
                ..Default::default()
            };
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&svc).unwrap()))
                    .unwrap(),
            );
        });

        let result = cache.get_pods_for_service("dev", "test-ns", "redis").await;
        assert!(matches!(result, Err(ForwardError::Kubernetes(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_is_pooled_per_context() {
        let (mock_service, _handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "test-ns");
        let factory = Arc::new(MockClientFactory {
            client,
            created: AtomicUsize::new(0),
        });
        let cache = KubeCache::new(factory.clone());

        cache.get_client("dev").await.unwrap();
        cache.get_client("dev").await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        cache.get_client("prod").await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_client_is_replaced() {
        let (mock_service, _handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "test-ns");
        let factory = Arc::new(MockClientFactory {
            client,
            created: AtomicUsize::new(0),
        });
        let cache = KubeCache::with_ttls(factory.clone(), Duration::from_millis(20), POD_LIST_TTL);

        cache.get_client("dev").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.get_client("dev").await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let (mock_service, _handle) = mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "test-ns");
        let factory = Arc::new(MockClientFactory {
            client,
            created: AtomicUsize::new(0),
        });
        let cache = KubeCache::with_ttls(
            factory,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        cache.get_client("dev").await.unwrap();
        assert_eq!(cache.clients.len(), 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.sweep_expired();
        assert!(cache.clients.is_empty());
    }
}
