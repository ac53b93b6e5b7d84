use crate::{
    index::SharedIndex,
    inject::{self, BootstrapStore, CertificateProvider, Injector, Workload},
    k8s::{Pod, Resource, VirtualMachine},
    metrics::AdmissionMetrics,
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::core::{admission::Operation, DynamicObject};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const MUTATE_PATH: &str = "/mutate-pod-creation";

pub struct Admission<C, S> {
    injector: Arc<Injector<C, S>>,
    index: SharedIndex,
    metrics: AdmissionMetrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl<C, S> Clone for Admission<C, S> {
    fn clone(&self) -> Self {
        Self {
            injector: self.injector.clone(),
            index: self.index.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<C, S> tower::Service<Request<hyper::body::Incoming>> for Admission<C, S>
where
    C: CertificateProvider + 'static,
    S: BootstrapStore + 'static,
{
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
        if req.method() != http::Method::POST || req.uri().path() != MUTATE_PATH {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            json_response(admission.review(bytes).await)
        })
    }
}

impl<C, S> Admission<C, S>
where
    C: CertificateProvider,
    S: BootstrapStore,
{
    pub fn new(injector: Injector<C, S>, index: SharedIndex, metrics: AdmissionMetrics) -> Self {
        Self {
            injector: Arc::new(injector),
            index,
            metrics,
        }
    }

    async fn review(self, body: bytes::Bytes) -> AdmissionReview {
        let review: Review = match serde_json::from_slice(&body) {
            Ok(review) => review,
            Err(error) => {
                warn!(%error, "Failed to parse request body");
                return AdmissionResponse::invalid(error).into_review();
            }
        };
        trace!(?review);

        let rsp = match review.try_into() {
            Ok(req) => {
                debug!(?req);
                self.admit(req).await
            }
            Err(error) => {
                warn!(%error, "Invalid admission request");
                AdmissionResponse::invalid(error)
            }
        };
        debug!(?rsp);
        rsp.into_review()
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let kind = if is_kind::<Pod>(&req) {
            "pod"
        } else if is_kind::<VirtualMachine>(&req) {
            "vm"
        } else {
            return AdmissionResponse::invalid(format_args!(
                "unsupported resource type: {}.{}.{}",
                req.kind.group, req.kind.version, req.kind.kind
            ));
        };

        let rsp = AdmissionResponse::from(&req);
        if req.operation != Operation::Create {
            trace!(operation = ?req.operation, "Not a create; allowing");
            self.metrics.request(kind, "skipped");
            return rsp;
        }

        let workload = match parse_workload(kind, &req) {
            Ok(workload) => workload,
            Err(error) => {
                info!(%error, %kind, "Failed to parse workload");
                self.metrics.request(kind, "denied");
                self.metrics.error("encoding");
                return rsp.deny(error);
            }
        };

        let ns = req.namespace.clone().unwrap_or_default();
        let (namespace, mesh, controller_ip) = {
            let index = self.index.read();
            (
                index.namespace(&ns).cloned(),
                index.mesh_config().cloned(),
                index.controller_ip(),
            )
        };
        let Some(namespace) = namespace else {
            info!(%ns, "Namespace not found");
            self.metrics.request(kind, "denied");
            return rsp.deny(format!("namespace {ns} not found"));
        };
        let Some(mesh) = mesh else {
            info!("Mesh configuration not yet observed");
            self.metrics.request(kind, "denied");
            return rsp.deny("mesh configuration is not available");
        };

        let mutated = self
            .injector
            .mutate(inject::Request {
                workload,
                namespace: &namespace,
                mesh: &mesh,
                controller_ip: controller_ip.map(|ip| ip.to_string()),
                proxy_uuid: uuid::Uuid::new_v4().to_string(),
                dry_run: req.dry_run,
            })
            .await;

        match mutated {
            Ok(Some(patch)) => match rsp.with_patch(patch) {
                Ok(rsp) => {
                    self.metrics.request(kind, "injected");
                    rsp
                }
                Err(error) => {
                    warn!(%error, "Failed to encode patch");
                    self.metrics.request(kind, "denied");
                    self.metrics.error("encoding");
                    AdmissionResponse::from(&req).deny(error)
                }
            },
            Ok(None) => {
                self.metrics.request(kind, "skipped");
                rsp
            }
            Err(error) => {
                info!(%error, %ns, name = %req.name, "Denied");
                self.metrics.request(kind, "denied");
                self.metrics.error(error.kind());
                rsp.deny(error)
            }
        }
    }
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

fn parse_workload(kind: &str, req: &AdmissionRequest) -> Result<Workload, serde_json::Error> {
    fn parse<T: DeserializeOwned>(obj: Option<&DynamicObject>) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(obj)?)
    }

    let obj = req.object.as_ref();
    Ok(match kind {
        "vm" => Workload::VirtualMachine(Box::new(parse(obj)?)),
        _ => Workload::Pod(Box::new(parse(obj)?)),
    })
}

#[cfg(test)]
mod tests;
