//! The fixed-port status server: build information and a health check.

use anyhow::Result;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, Instrument};

pub const STATUS_PORT: u16 = 9091;

type Body = http_body_util::Full<bytes::Bytes>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_date: &'static str,
}

impl Version {
    pub const fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_commit: match option_env!("XMESH_GIT_COMMIT") {
                Some(commit) => commit,
                None => "unknown",
            },
            build_date: match option_env!("XMESH_BUILD_DATE") {
                Some(date) => date,
                None => "unknown",
            },
        }
    }
}

/// Serves `/version` and `/health` until shutdown is signaled.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve(addr: SocketAddr, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Status server listening");

    tokio::pin! {
        let shutdown = drain.clone().signaled();
    }
    loop {
        let (io, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            handle = &mut shutdown => {
                drop(handle);
                return Ok(());
            }
        };

        let drain = drain.clone();
        tokio::spawn(
            async move {
                let conn = hyper::server::conn::http1::Builder::new().serve_connection(
                    TokioIo::new(io),
                    hyper::service::service_fn(|req| async move {
                        Ok::<_, Infallible>(route(&req))
                    }),
                );
                tokio::pin!(conn);
                tokio::select! {
                    res = &mut conn => {
                        if let Err(error) = res {
                            debug!(%error, "Connection failed");
                        }
                    }
                    handle = drain.signaled() => {
                        conn.as_mut().graceful_shutdown();
                        let _ = handle.release_after(conn).await;
                    }
                }
            }
            .instrument(tracing::debug_span!("conn", %peer)),
        );
    }
}

fn route<B>(req: &Request<B>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/version") => match serde_json::to_vec(&Version::current()) {
            Ok(json) => respond(StatusCode::OK, Some("application/json"), json.into()),
            Err(_) => respond(StatusCode::INTERNAL_SERVER_ERROR, None, Body::default()),
        },
        (&Method::GET, "/health") => respond(StatusCode::OK, None, Body::from("OK")),
        _ => respond(StatusCode::NOT_FOUND, None, Body::default()),
    }
}

fn respond(status: StatusCode, content_type: Option<&str>, body: Body) -> Response<Body> {
    let mut rsp = Response::builder().status(status);
    if let Some(ct) = content_type {
        rsp = rsp.header(http::header::CONTENT_TYPE, ct);
    }
    rsp.body(body).expect("status response must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use rstest::rstest;

    async fn body(rsp: Response<Body>) -> bytes::Bytes {
        rsp.into_body().collect().await.unwrap().to_bytes()
    }

    fn get(path: &str) -> Request<()> {
        Request::get(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn serves_version() {
        let rsp = route(&get("/version"));
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(
            rsp.headers()[http::header::CONTENT_TYPE],
            "application/json"
        );
        let json: serde_json::Value = serde_json::from_slice(&body(rsp).await).unwrap();
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert!(json["gitCommit"].is_string());
        assert!(json["buildDate"].is_string());
    }

    #[tokio::test]
    async fn serves_health() {
        let rsp = route(&get("/health"));
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(body(rsp).await, "OK");
    }

    #[rstest]
    #[case(Method::GET, "/metrics")]
    #[case(Method::GET, "/")]
    #[case(Method::POST, "/health")]
    #[case(Method::DELETE, "/version")]
    fn unknown_routes(#[case] method: Method, #[case] path: &str) {
        let req = Request::builder().method(method).uri(path).body(()).unwrap();
        assert_eq!(route(&req).status(), StatusCode::NOT_FOUND);
    }
}
