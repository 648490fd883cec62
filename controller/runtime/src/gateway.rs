//! Serves client traffic for metered Services.
//!
//! Every request is charged against the ledger before it is forwarded to the
//! network endpoint fronting the Service's workload. Paid requests record
//! activity, which is what scales idle workloads back up.

use crate::{
    k8s::{
        labels::LAST_REQUEST_TIME_ANNOTATION, Api, Client, NetworkService, Patch, PatchParams,
        Service,
    },
    ledger::Spend,
    metrics::{GatewayMetrics, Outcome as OutcomeLabel},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty};
use hyper::{body::Incoming, http, Request, Response, StatusCode};
use hyper_util::{
    client::legacy::{
        connect::{Connect, HttpConnector},
        Client as HttpClient,
    },
    rt::TokioExecutor,
};
use std::sync::Arc;
use tollgate_controller_core::{
    gateway::{identity_from_host, is_available, is_unavailable, upstream_authority, ErrorPage},
    reconcile::format_last_request_time,
};
use tracing::{debug, info, warn, Instrument};

pub type Body = UnsyncBoxBody<Bytes, hyper::Error>;

/// Reads and annotates Services on behalf of the gateway.
#[async_trait::async_trait]
pub trait Services: Clone + Send + Sync + 'static {
    async fn lookup(&self, name: &str) -> Result<Option<Service>, kube::Error>;

    /// Records that `svc` served a paid request at `time`.
    async fn record_activity(&self, svc: &Service, time: DateTime<Utc>)
        -> Result<(), kube::Error>;
}

#[derive(Clone, Debug)]
pub struct Config {
    pub namespace: String,
    pub web_url: String,
    pub request_price: u64,
}

#[derive(Clone)]
pub struct Gateway<S, L, C = HttpConnector> {
    services: S,
    ledger: L,
    config: Arc<Config>,
    metrics: GatewayMetrics,
    client: HttpClient<C, Incoming>,
}

/// Kubernetes-backed [`Services`].
#[derive(Clone)]
pub struct KubeServices {
    services: Api<Service>,
    endpoints: Api<NetworkService>,
}

/// How a request is answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    NotFound,
    BadGateway,
    Redirect(String),
    Forward(String),
}

// === impl Gateway ===

impl<S: Services, L: Spend> Gateway<S, L> {
    pub fn new(services: S, ledger: L, config: Config, metrics: GatewayMetrics) -> Self {
        Self::with_connector(services, ledger, config, metrics, HttpConnector::new())
    }
}

impl<S, L, C> Gateway<S, L, C>
where
    S: Services,
    L: Spend,
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn with_connector(
        services: S,
        ledger: L,
        config: Config,
        metrics: GatewayMetrics,
        connector: C,
    ) -> Self {
        let client = HttpClient::builder(TokioExecutor::new()).build(connector);
        Self {
            services,
            ledger,
            config: Arc::new(config),
            metrics,
            client,
        }
    }

    /// Decides how to answer a request for `host`, charging for it and
    /// recording activity when it is paid for.
    pub async fn admit(&self, host: &str) -> Outcome {
        let Some(id) = identity_from_host(host) else {
            return Outcome::NotFound;
        };

        let svc = match self.services.lookup(id).await {
            Ok(Some(svc)) => svc,
            Ok(None) => return Outcome::NotFound,
            Err(error) => {
                warn!(%error, %id, "Failed to look up service");
                return Outcome::BadGateway;
            }
        };

        let status = svc.status.as_ref();
        if is_unavailable(status) {
            return self.redirect(ErrorPage::Unavailable, id);
        }

        if let Err(error) = self.ledger.spend(id, self.config.request_price).await {
            info!(%error, %id, "Payment required");
            return self.redirect(ErrorPage::PaymentRequired, id);
        }

        let services = self.services.clone();
        let record = svc.clone();
        tokio::spawn(
            async move {
                if let Err(error) = services.record_activity(&record, Utc::now()).await {
                    debug!(%error, "Activity not fully recorded");
                }
            }
            .instrument(tracing::debug_span!("activity", %id)),
        );

        if !is_available(status) {
            return self.redirect(ErrorPage::Unavailable, id);
        }
        match upstream_authority(&svc, &self.config.namespace) {
            Some(authority) => Outcome::Forward(authority),
            None => self.redirect(ErrorPage::Unavailable, id),
        }
    }

    fn redirect(&self, page: ErrorPage, id: &str) -> Outcome {
        Outcome::Redirect(page.url(&self.config.web_url, id))
    }

    async fn forward(
        &self,
        host: &str,
        authority: &str,
        mut req: Request<Incoming>,
    ) -> Response<Body> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = match format!("http://{authority}{path}").parse::<http::Uri>() {
            Ok(uri) => uri,
            Err(error) => {
                warn!(%error, "Invalid upstream uri");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };
        *req.uri_mut() = uri;
        // Endpoints are reached over HTTP/1 whatever the client spoke, and
        // see the host the client asked for.
        *req.version_mut() = http::Version::HTTP_11;
        strip_connection_headers(req.headers_mut());
        if !req.headers().contains_key(http::header::HOST) {
            if let Ok(host) = http::HeaderValue::from_str(host) {
                req.headers_mut().insert(http::header::HOST, host);
            }
        }

        match self.client.request(req).await {
            Ok(mut rsp) => {
                strip_connection_headers(rsp.headers_mut());
                rsp.map(BodyExt::boxed_unsync)
            }
            Err(error) => {
                warn!(%error, %authority, "Upstream request failed");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl<S, L, C> tower::Service<Request<Incoming>> for Gateway<S, L, C>
where
    S: Services,
    L: Spend,
    C: Connect + Clone + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let gateway = self.clone();
        Box::pin(async move {
            let host = request_host(&req).unwrap_or_default();
            let outcome = gateway.admit(&host).await;
            debug!(%host, ?outcome);
            let rsp = match outcome {
                Outcome::NotFound => {
                    gateway.metrics.inc(OutcomeLabel::NotFound);
                    status_response(StatusCode::NOT_FOUND)
                }
                Outcome::BadGateway => {
                    gateway.metrics.inc(OutcomeLabel::Error);
                    status_response(StatusCode::BAD_GATEWAY)
                }
                Outcome::Redirect(location) => {
                    gateway.metrics.inc(OutcomeLabel::Redirected);
                    redirect_response(&location)
                }
                Outcome::Forward(authority) => {
                    gateway.metrics.inc(OutcomeLabel::Forwarded);
                    gateway.forward(&host, &authority, req).await
                }
            };
            Ok(rsp)
        })
    }
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
    {
        return Some(host.to_string());
    }
    req.uri().host().map(str::to_string)
}

/// Removes `Connection` and every header it names, since they only apply to
/// a single hop.
fn strip_connection_headers(headers: &mut http::HeaderMap) {
    let Some(value) = headers.remove(http::header::CONNECTION) else {
        return;
    };
    let Ok(names) = value.to_str() else {
        return;
    };
    for name in names.split(',') {
        headers.remove(name.trim());
    }
}

fn empty() -> Body {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(empty())
        .expect("status response must be valid")
}

fn redirect_response(location: &str) -> Response<Body> {
    match Response::builder()
        .status(StatusCode::FOUND)
        .header(http::header::LOCATION, location)
        .body(empty())
    {
        Ok(rsp) => rsp,
        Err(error) => {
            warn!(%error, %location, "Invalid redirect location");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// === impl KubeServices ===

impl KubeServices {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::all(client.clone()),
            endpoints: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl Services for KubeServices {
    async fn lookup(&self, name: &str) -> Result<Option<Service>, kube::Error> {
        self.services.get_opt(name).await
    }

    async fn record_activity(
        &self,
        svc: &Service,
        time: DateTime<Utc>,
    ) -> Result<(), kube::Error> {
        let time = format_last_request_time(time);
        let params = PatchParams::default();
        let name = kube::ResourceExt::name_any(svc);

        // The endpoint is owned by the immutable Service, so annotating it
        // triggers the reconcile that scales the workload. It may not exist
        // yet, which must not prevent the status write.
        let mut endpoint = Ok(());
        if let Some(label) = svc.service_label() {
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": { LAST_REQUEST_TIME_ANNOTATION: &time },
                },
            });
            endpoint = self
                .endpoints
                .patch(label, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ());
            if let Err(error) = &endpoint {
                warn!(%error, %label, "Failed to annotate endpoint");
            }
        }

        let patch = serde_json::json!({ "status": { "lastRequestTime": &time } });
        let status = self
            .services
            .patch_status(&name, &params, &Patch::Merge(&patch))
            .await
            .map(|_| ());
        if let Err(error) = &status {
            warn!(%error, %name, "Failed to record last request time");
        }

        endpoint.and(status)
    }
}
