//! HTTP API for clients to upload and inspect Services.

use crate::{
    k8s::{
        labels::{HASH_ANNOTATION, HOSTNAME_ANNOTATION, TOKEN_LABEL},
        Api, ObjectMeta, PostParams, ResourceExt, Service, ServiceSpec,
    },
    ledger::Spend,
};
use bytes::Bytes;
use futures::future;
use http_body_util::{BodyExt, Full};
use hyper::{http, Request, Response, StatusCode};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};
use tollgate_controller_core::identity::token_label;
use tracing::{debug, info, warn};

type Body = Full<Bytes>;

/// Reads and writes Services on behalf of API clients.
#[async_trait::async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Option<Service>, kube::Error>;

    async fn create(&self, svc: &Service) -> Result<(), kube::Error>;

    async fn replace(&self, svc: &Service) -> Result<(), kube::Error>;
}

#[derive(Clone, Debug)]
pub struct Config {
    pub hostname_suffix: String,
    pub service_price: u64,
}

#[derive(Clone)]
pub struct ServicesApi<S, L> {
    store: S,
    ledger: L,
    config: Arc<Config>,
}

/// The body of an upload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Upload {
    spec: ServiceSpec,

    #[serde(default)]
    secret_data: Option<BTreeMap<String, String>>,
}

// === impl ServicesApi ===

impl<S: Store, L: Spend> ServicesApi<S, L> {
    pub fn new(store: S, ledger: L, config: Config) -> Self {
        Self {
            store,
            ledger,
            config: Arc::new(config),
        }
    }

    async fn put(&self, name: &str, token: Option<String>, body: Bytes) -> Response<Body> {
        let Some(token) = token else {
            return text_response(
                StatusCode::UNAUTHORIZED,
                "Authorization header format must be Bearer {token}",
            );
        };

        let Upload { spec, secret_data } = match serde_json::from_slice(&body) {
            Ok(upload) => upload,
            Err(error) => {
                info!(%error, %name, "Failed to decode service");
                return text_response(StatusCode::BAD_REQUEST, &error.to_string());
            }
        };

        if let Err(error) = self.ledger.spend(&token, self.config.service_price).await {
            info!(%error, %name, "Failed to spend balance");
            return status_response(StatusCode::PAYMENT_REQUIRED);
        }

        let mut svc = Service::new(name, spec);
        svc.secret_data = secret_data;
        svc.labels_mut()
            .insert(TOKEN_LABEL.to_string(), token_label(&token));

        let res = match self.store.get(name).await {
            Ok(Some(existing)) => {
                svc.metadata.resource_version = existing.resource_version();
                self.store.replace(&svc).await.map(|()| StatusCode::OK)
            }
            Ok(None) => self.store.create(&svc).await.map(|()| StatusCode::CREATED),
            Err(error) => Err(error),
        };
        match res {
            Ok(status) => {
                debug!(%name, %status, "Stored service");
                status_response(status)
            }
            Err(error) => {
                warn!(%error, %name, "Failed to store service");
                status_response(error_status(&error))
            }
        }
    }

    async fn get(&self, name: &str) -> Response<Body> {
        let svc = match self.store.get(name).await {
            Ok(Some(svc)) => svc,
            Ok(None) => return status_response(StatusCode::NOT_FOUND),
            Err(error) => {
                warn!(%error, %name, "Failed to read service");
                return status_response(error_status(&error));
            }
        };

        match serde_json::to_vec(&sanitize(&svc, &self.config.hostname_suffix)) {
            Ok(bytes) => Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "application/json; charset=UTF-8")
                .body(Body::from(bytes))
                .expect("service response must be valid"),
            Err(error) => {
                warn!(%error, %name, "Failed to encode service");
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl<S, L, B> tower::Service<Request<B>> for ServicesApi<S, L>
where
    S: Store,
    L: Spend,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: std::fmt::Display + Send,
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

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let api = self.clone();
        Box::pin(async move {
            let Some(name) = service_name(req.uri().path()).map(str::to_string) else {
                return Ok(with_cors(status_response(StatusCode::NOT_FOUND)));
            };

            let rsp = match *req.method() {
                http::Method::OPTIONS => status_response(StatusCode::NO_CONTENT),
                http::Method::GET => api.get(&name).await,
                http::Method::PUT => {
                    let token = bearer_token(req.headers());
                    match req.into_body().collect().await {
                        Ok(body) => api.put(&name, token, body.to_bytes()).await,
                        Err(error) => {
                            info!(%error, %name, "Failed to read request body");
                            status_response(StatusCode::BAD_REQUEST)
                        }
                    }
                }
                _ => status_response(StatusCode::METHOD_NOT_ALLOWED),
            };
            Ok(with_cors(rsp))
        })
    }
}

// === impl Store ===

#[async_trait::async_trait]
impl Store for Api<Service> {
    async fn get(&self, name: &str) -> Result<Option<Service>, kube::Error> {
        self.get_opt(name).await
    }

    async fn create(&self, svc: &Service) -> Result<(), kube::Error> {
        Api::create(self, &PostParams::default(), svc).await?;
        Ok(())
    }

    async fn replace(&self, svc: &Service) -> Result<(), kube::Error> {
        Api::replace(self, &svc.name_any(), &PostParams::default(), svc).await?;
        Ok(())
    }
}

/// Strips a Service down to what clients may see.
fn sanitize(svc: &Service, hostname_suffix: &str) -> Service {
    let name = svc.name_any();
    let mut annotations = BTreeMap::new();
    if let Some(hash) = svc.spec_hash() {
        annotations.insert(HASH_ANNOTATION.to_string(), hash.to_string());
    }
    annotations.insert(
        HOSTNAME_ANNOTATION.to_string(),
        format!("{name}.{hostname_suffix}"),
    );

    Service {
        types: svc.types.clone(),
        metadata: ObjectMeta {
            name: Some(name),
            creation_timestamp: svc.metadata.creation_timestamp.clone(),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: svc.spec.clone(),
        secret_data: None,
        status: svc.status.clone(),
    }
}

fn service_name(path: &str) -> Option<&str> {
    let name = path.strip_prefix("/services/")?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name)
}

fn bearer_token(headers: &http::HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let mut parts = value.split_whitespace();
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.to_string())
}

fn error_status(error: &kube::Error) -> StatusCode {
    match error {
        kube::Error::Api(rsp) => {
            StatusCode::from_u16(rsp.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn with_cors(mut rsp: Response<Body>) -> Response<Body> {
    let headers = rsp.headers_mut();
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        http::HeaderValue::from_static("*"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_METHODS,
        http::HeaderValue::from_static("GET, PUT, OPTIONS"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        http::HeaderValue::from_static("Authorization, Content-Type"),
    );
    rsp
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("status response must be valid")
}

fn text_response(status: StatusCode, text: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(format!("{text}\n")))
        .expect("text response must be valid")
}
