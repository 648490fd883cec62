use crate::k8s::{Api, Resource, Secret, SecretSpec, Service};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tollgate_controller_core::{admission::Resource as Object, secrets::NamedSecrets};
use tracing::{debug, info, trace, warn};

/// Serves the mutating (`/mutate`) and validating (`/validate`) webhooks for
/// Services and Secrets.
#[derive(Clone)]
pub struct Admission<S = Api<Secret>> {
    secrets: S,
}

/// Reads the Secrets a Service refers to.
#[async_trait::async_trait]
pub trait SecretStore: Clone + Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Option<SecretSpec>, kube::Error>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Mutate,
    Validate,
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl AdmissionService ===

impl<S: SecretStore> tower::Service<Request<hyper::body::Incoming>> for Admission<S> {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        let mode = match (req.method(), req.uri().path()) {
            (&http::Method::POST, "/mutate") => Mode::Mutate,
            (&http::Method::POST, "/validate") => Mode::Validate,
            _ => {
                return Box::pin(future::ok(
                    Response::builder()
                        .status(http::StatusCode::NOT_FOUND)
                        .body(Body::default())
                        .expect("not found response must be valid"),
                ))
            }
        };

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req, mode).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new(client: kube::Client) -> Self {
        Self::with_store(Api::all(client))
    }
}

impl<S: SecretStore> Admission<S> {
    pub fn with_store(secrets: S) -> Self {
        Self { secrets }
    }

    async fn admit(self, req: AdmissionRequest, mode: Mode) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let kind = req.kind.kind.clone();

        let obj = if is_kind::<Service>(&req) {
            decode::<Service>(&req).map(|(new, old)| {
                (
                    new.map(|s| Object::Service(Box::new(s))),
                    old.map(|s| Object::Service(Box::new(s))),
                )
            })
        } else if is_kind::<Secret>(&req) {
            decode::<Secret>(&req).map(|(new, old)| {
                (
                    new.map(|s| Object::Secret(Box::new(s))),
                    old.map(|s| Object::Secret(Box::new(s))),
                )
            })
        } else {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        };

        let (obj, old) = match obj {
            Ok(objs) => objs,
            Err(error) => {
                info!(%error, "Failed to parse {}", kind);
                return rsp.deny(error);
            }
        };

        if req.operation == Operation::Delete {
            if let Some(Err(error)) = old.as_ref().map(Object::validate_delete) {
                return rsp.deny(error);
            }
            return rsp;
        }

        let Some(mut obj) = obj else {
            return rsp.deny(anyhow!("admission request missing 'object'"));
        };

        let name = obj.name();
        match mode {
            Mode::Mutate => match defaults_patch(&mut obj) {
                Ok(patch) => match rsp.clone().with_patch(patch) {
                    Ok(rsp) => rsp,
                    Err(error) => {
                        warn!(%error, %name, "Failed to encode patch");
                        rsp.deny(error)
                    }
                },
                Err(error) => rsp.deny(error),
            },

            Mode::Validate => {
                let named = match self.fetch_secrets(&obj).await {
                    Ok(named) => named,
                    Err(error) => {
                        info!(%error, %name, %kind, "Denied");
                        return rsp.deny(error);
                    }
                };

                let res = match (req.operation, old.as_ref()) {
                    (Operation::Update, Some(old)) => obj.validate_update(old, &named),
                    _ => obj.validate_create(&named),
                };
                if let Err(error) = res {
                    info!(%error, %name, %kind, "Denied");
                    return rsp.deny(error);
                }
                rsp
            }
        }
    }

    /// Fetches every Secret the resource refers to, once per name.
    async fn fetch_secrets(&self, obj: &Object) -> Result<NamedSecrets> {
        let mut named = NamedSecrets::new();
        for name in obj.referenced_secrets() {
            let secret = self
                .secrets
                .get(&name)
                .await
                .map_err(|error| anyhow!("failed to read secret {name}: {error}"))?;
            named.insert(name, secret);
        }
        Ok(named)
    }
}

#[async_trait::async_trait]
impl SecretStore for Api<Secret> {
    async fn get(&self, name: &str) -> Result<Option<SecretSpec>, kube::Error> {
        Ok(self.get_opt(name).await?.map(|secret| secret.spec))
    }
}

/// Applies defaults and describes them as a patch of the submitted object.
fn defaults_patch(obj: &mut Object) -> Result<json_patch::Patch> {
    let before = serde_json::to_value(&*obj)?;
    obj.apply_defaults();
    let after = serde_json::to_value(&*obj)?;
    Ok(json_patch::diff(&before, &after))
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn decode<T: DeserializeOwned>(req: &AdmissionRequest) -> Result<(Option<T>, Option<T>)> {
    let parse = |obj: &DynamicObject| -> Result<T> {
        let value = serde_json::to_value(obj)?;
        Ok(serde_json::from_value(value)?)
    };
    let obj = req.object.as_ref().map(parse).transpose()?;
    let old = req.old_object.as_ref().map(parse).transpose()?;
    Ok((obj, old))
}
