use anyhow::{Context, Result};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use prometheus_client::registry::Registry;
use rbac_policy_authz::{AccessReviews, ReviewError, ReviewRequest};
use rbac_policy_core::{UserInfo, AUTHENTICATED_GROUP};
use rbac_policy_index::Reader;
use std::{convert::Infallible, fmt, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

pub const ACCESS_REVIEW_PATH: &str = "/access-review";

/// The caller's name, as asserted by an authenticating proxy.
pub const REMOTE_USER_HEADER: &str = "x-remote-user";

/// The caller's groups, as asserted by an authenticating proxy. May be repeated or
/// comma-separated.
pub const REMOTE_GROUP_HEADER: &str = "x-remote-group";

/// Serves readiness, metrics, and access reviews.
#[derive(Clone, Debug)]
pub struct Admin {
    reader: Reader,
    registry: Arc<Registry>,
    reviews: AccessReviews,
    review_timeout: time::Duration,
    shutdown: CancellationToken,
}

type Rsp = Response<Full<Bytes>>;

/// Serves `admin` on `addr` until `drain` is signaled.
///
/// On shutdown, reviews still waiting for the index are canceled.
#[instrument(skip_all, fields(%addr))]
pub async fn serve(addr: SocketAddr, admin: Admin, drain: drain::Watch) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind admin server on {addr}"))?;
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP admin server listening");

    tokio::pin! {
        let shutdown = drain.signaled();
    }
    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                debug!("Shutting down admin server");
                admin.shutdown.cancel();
                return Ok(());
            }
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%error, "Failed to accept connection");
                    continue;
                }
            },
        };

        let admin = admin.clone();
        tokio::spawn(
            async move {
                let svc = service_fn(move |req| {
                    let admin = admin.clone();
                    async move { Ok::<_, Infallible>(admin.handle(req).await) }
                });
                if let Err(error) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await
                {
                    debug!(%error, "Connection failed");
                }
            }
            .instrument(info_span!("conn", %peer)),
        );
    }
}

// === impl Admin ===

impl Admin {
    /// Reviews that are not decided within `review_timeout` fail as unavailable.
    pub fn new(
        reader: Reader,
        registry: Registry,
        reviews: AccessReviews,
        review_timeout: time::Duration,
    ) -> Self {
        Self {
            reader,
            registry: Arc::new(registry),
            reviews,
            review_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Rsp
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: fmt::Display,
    {
        match req.uri().path() {
            "/ready" => match *req.method() {
                Method::GET | Method::HEAD => self.ready(),
                _ => method_not_allowed(),
            },
            "/metrics" => match *req.method() {
                Method::GET => self.metrics(),
                _ => method_not_allowed(),
            },
            ACCESS_REVIEW_PATH => match *req.method() {
                Method::POST => self.access_review(req).await,
                _ => method_not_allowed(),
            },
            _ => text(StatusCode::NOT_FOUND, "not found\n"),
        }
    }

    fn ready(&self) -> Rsp {
        if !self.reader.is_closed() && self.reader.snapshot().is_synced() {
            text(StatusCode::OK, "ready\n")
        } else {
            text(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
        }
    }

    fn metrics(&self) -> Rsp {
        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, &self.registry) {
            warn!(%error, "Failed to encode metrics");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n");
        }
        let mut rsp = Response::new(Full::new(Bytes::from(buf)));
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/openmetrics-text; version=1.0.0; charset=utf-8"),
        );
        rsp
    }

    async fn access_review<B>(&self, req: Request<B>) -> Rsp
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: fmt::Display,
    {
        let Some(caller) = caller(req.headers()) else {
            return text(
                StatusCode::UNAUTHORIZED,
                format!("missing {REMOTE_USER_HEADER} header\n"),
            );
        };

        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(error) => {
                debug!(%error, "Failed to read request body");
                return text(StatusCode::BAD_REQUEST, "failed to read request body\n");
            }
        };
        let request = match serde_json::from_slice::<ReviewRequest>(&body) {
            Ok(request) => request,
            Err(error) => {
                return text(
                    StatusCode::BAD_REQUEST,
                    format!("invalid access review: {error}\n"),
                )
            }
        };

        let cancel = self.shutdown.child_token();
        let review = self.reviews.review(&caller, &request, &cancel);
        let Ok(res) = time::timeout(self.review_timeout, review).await else {
            warn!(timeout = ?self.review_timeout, "Access review timed out");
            return text(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("access review timed out after {:?}\n", self.review_timeout),
            );
        };
        match res {
            Ok(review) => match serde_json::to_vec(&review) {
                Ok(json) => {
                    let mut rsp = Response::new(Full::new(Bytes::from(json)));
                    rsp.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    rsp
                }
                Err(error) => {
                    warn!(%error, "Failed to encode access review");
                    text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode review\n")
                }
            },
            Err(error @ ReviewError::Forbidden { .. }) => {
                text(StatusCode::FORBIDDEN, format!("{error}\n"))
            }
            Err(error) => text(StatusCode::SERVICE_UNAVAILABLE, format!("{error}\n")),
        }
    }
}

/// Reads the caller's identity from the authenticating proxy's headers. Every asserted user is a
/// member of the authenticated group.
fn caller(headers: &HeaderMap) -> Option<UserInfo> {
    let user = headers.get(REMOTE_USER_HEADER)?.to_str().ok()?.trim();
    if user.is_empty() {
        return None;
    }

    let groups = headers
        .get_all(REMOTE_GROUP_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .chain(Some(AUTHENTICATED_GROUP));
    Some(UserInfo::new(user, groups))
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Rsp {
    let mut rsp = Response::new(Full::new(body.into()));
    *rsp.status_mut() = status;
    rsp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    rsp
}

fn method_not_allowed() -> Rsp {
    text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n")
}
