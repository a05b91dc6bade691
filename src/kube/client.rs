//! Kubernetes client construction.
//!
//! The local cluster client comes from a kubeconfig path or, when no path is
//! given, from the in-cluster environment. Remote cluster clients can also
//! be built from an API URL, a CA bundle URL and a bearer token, which is
//! how independently administered clusters grant scoped node access without
//! shipping kubeconfigs around.
//!
//! Every client is wrapped with a service layer that counts API requests
//! into `semaphore_wg_kube_http_request_total{host, code, method}`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};

use base64::prelude::*;
use http::{Request, Response};
use hyper_util::rt::TokioExecutor;
use kube::client::ConfigExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use regex::Regex;
use tower::{BoxError, Layer, Service, ServiceBuilder};

use crate::error::Error;
use crate::metrics;

static BEARER_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-\._~\+/]+=*$").expect("valid bearer token regex"));

/// Validate that a trimmed service account token looks like a bearer token
pub fn validate_bearer_token(token: &str) -> Result<(), Error> {
    if !BEARER_TOKEN_RE.is_match(token) {
        return Err(Error::client(
            "the provided token does not look like a bearer token",
        ));
    }
    Ok(())
}

/// Build a client from a kubeconfig path, or from the in-cluster service
/// account environment when the path is empty.
pub async fn client_from_kubeconfig(path: &str) -> Result<Client, Error> {
    let config = if path.is_empty() {
        Config::infer()
            .await
            .map_err(|e| Error::client(format!("cannot infer kube config: {e}")))?
    } else {
        let kubeconfig = Kubeconfig::read_from(path)
            .map_err(|e| Error::client(format!("cannot read kubeconfig {path}: {e}")))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::client(format!("cannot load kubeconfig {path}: {e}")))?
    };
    build_client(config)
}

/// Build a client for a remote cluster from a bearer token, an API server
/// URL and a URL serving the cluster's CA bundle.
pub async fn client_from_token(token: &str, api_url: &str, ca_url: &str) -> Result<Client, Error> {
    let token = token.trim();
    validate_bearer_token(token)?;
    let ca_pem = fetch_ca_bundle(ca_url).await?;
    let kubeconfig: Kubeconfig = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "remote",
            "cluster": {
                "server": api_url,
                "certificate-authority-data": BASE64_STANDARD.encode(&ca_pem),
            }
        }],
        "users": [{
            "name": "remote",
            "user": {"token": token}
        }],
        "contexts": [{
            "name": "remote",
            "context": {"cluster": "remote", "user": "remote"}
        }],
        "current-context": "remote",
    }))
    .map_err(|e| Error::client(format!("cannot assemble remote kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::client(format!("cannot load remote kubeconfig: {e}")))?;
    build_client(config)
}

async fn fetch_ca_bundle(ca_url: &str) -> Result<Vec<u8>, Error> {
    let response = reqwest::get(ca_url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::client(format!("cannot fetch remote CA from {ca_url}: {e}")))?;
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::client(format!("cannot read remote CA body: {e}")))?;
    Ok(body.to_vec())
}

/// Assemble a [`Client`] from a [`Config`], inserting the request counting
/// layer into the service stack.
pub fn build_client(config: Config) -> Result<Client, Error> {
    let host = config
        .cluster_url
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let connector = config
        .rustls_https_connector()
        .map_err(|e| Error::client(format!("cannot build https connector: {e}")))?;
    let http_client: hyper_util::client::legacy::Client<_, kube::client::Body> =
        hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);
    let auth_layer = config
        .auth_layer()
        .map_err(|e| Error::client(format!("cannot build auth layer: {e}")))?;
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(auth_layer)
        .layer(RequestMetricsLayer::new(host))
        .map_err(BoxError::from)
        .service(http_client);
    Ok(Client::new(service, config.default_namespace))
}

/// Layer that counts API server requests by host, status code and method
#[derive(Clone)]
pub struct RequestMetricsLayer {
    host: Arc<str>,
}

impl RequestMetricsLayer {
    /// Create a layer labelling requests with the given API server host
    pub fn new(host: impl Into<Arc<str>>) -> Self {
        Self { host: host.into() }
    }
}

impl<S> Layer<S> for RequestMetricsLayer {
    type Service = RequestMetrics<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestMetrics {
            inner,
            host: self.host.clone(),
        }
    }
}

/// Service wrapper produced by [`RequestMetricsLayer`]
#[derive(Clone)]
pub struct RequestMetrics<S> {
    inner: S,
    host: Arc<str>,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for RequestMetrics<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqB>) -> Self::Future {
        let method = request.method().as_str().to_string();
        let host = Arc::clone(&self.host);
        let future = self.inner.call(request);
        Box::pin(async move {
            let result = future.await;
            if let Ok(response) = &result {
                metrics::inc_kube_http_request(&host, response.status().as_u16(), &method);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{KubeRequestLabels, KUBE_HTTP_REQUESTS};

    #[test]
    fn bearer_tokens_are_validated() {
        assert!(validate_bearer_token("abcDEF123-._~+/==").is_ok());
        assert!(validate_bearer_token("eyJhbGciOiJSUzI1NiJ9.payload.sig").is_ok());
        assert!(validate_bearer_token("has space").is_err());
        assert!(validate_bearer_token("").is_err());
        assert!(validate_bearer_token("with\nnewline").is_err());
    }

    #[tokio::test]
    async fn request_metrics_layer_counts_responses() {
        use tower::ServiceExt;

        let service = tower::service_fn(|_req: Request<String>| async {
            Ok::<_, BoxError>(Response::builder().status(201).body(String::new()).unwrap())
        });
        let mut wrapped = RequestMetricsLayer::new("api.test.local:6443").layer(service);

        let request = Request::builder()
            .method("PATCH")
            .uri("https://api.test.local:6443/api/v1/nodes/x")
            .body(String::new())
            .unwrap();
        wrapped.ready().await.unwrap().call(request).await.unwrap();

        let count = KUBE_HTTP_REQUESTS
            .get_or_create(&KubeRequestLabels {
                host: "api.test.local:6443".to_string(),
                code: "201".to_string(),
                method: "PATCH".to_string(),
            })
            .get();
        assert_eq!(count, 1);
    }
}
