use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::ctl::BucketCtl;
use crate::error::Error;
use crate::reply::{UploadEntReply, UploadReply};
use crate::request::ProxyRequest;
use crate::transport::Transport;

/// HTTP body type for responses
type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const NOBUCKET_UPLOAD_PREFIX: &str = "nobucket_upload";
const UPLOAD_PREFIX: &str = "upload";
const GET_PREFIX: &str = "get";
const STREAM_PREFIX: &str = "stream";
const LOOKUP_PREFIX: &str = "lookup";
const DELETE_PREFIX: &str = "delete";
const BULK_DELETE_PREFIX: &str = "bulk_delete";
const PING_PREFIX: &str = "ping";
const STAT_PREFIX: &str = "stat";

/// `POST /bulk_delete/<bucket>` request body
#[derive(Debug, Deserialize)]
struct BulkDeleteRequest {
    keys: Vec<String>,
}

pub struct ProxyServer<T: Transport> {
    ctl: Arc<BucketCtl<T>>,
    listen: String,
}

impl<T: Transport> ProxyServer<T> {
    pub fn new(ctl: Arc<BucketCtl<T>>, listen: String) -> Self {
        Self { ctl, listen }
    }

    /// Accept loop; one spawned task per connection, one per request so
    /// a panicking handler only kills its own request.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .context(format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind to {}", addr))?;

        info!("blobpool proxy listening on {}", addr);

        let server = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move {
                        let handled = tokio::spawn(async move { server.handle_request(req).await });
                        match handled.await {
                            Ok(resp) => Ok::<_, std::convert::Infallible>(resp),
                            Err(e) => {
                                error!(error = %e, "request handler died");
                                Ok(plain_response(
                                    StatusCode::SERVICE_UNAVAILABLE,
                                    "request handler failed".to_string(),
                                ))
                            }
                        }
                    }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    let err_str = format!("{}", e);
                    if !err_str.contains("connection reset") && !err_str.contains("broken pipe") {
                        debug!("Error serving connection from {}: {}", remote_addr, e);
                    }
                }
            });
        }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<BoxBody> {
        let timeout = Duration::from_secs(self.ctl.config().idle_timeout.max(1));

        match tokio::time::timeout(timeout, self.dispatch(req)).await {
            Ok(resp) => resp,
            Err(_) => plain_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("request did not complete within {:?}", timeout),
            ),
        }
    }

    async fn dispatch(&self, req: Request<Incoming>) -> Response<BoxBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let headers = req.headers().clone();
        let host = headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.listen)
            .to_string();

        debug!("{} {}", method, uri);

        let body = match req.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return plain_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read request body: {}", e),
                )
            }
        };

        let preq = ProxyRequest::new(method, uri, headers);
        let path = preq.uri.path().to_string();

        // path shape: /handler[/bucket[/key...]]
        let mut parts = path.splitn(3, '/');
        let _ = parts.next();
        let handler = match parts.next() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => {
                return error_response(&Error::bad_request(
                    preq.url(),
                    "could not split path to /handler, there must be at least 1 slash",
                ))
            }
        };
        let rest = parts.next().unwrap_or("").to_string();

        match handler.as_str() {
            PING_PREFIX => return self.ping(),
            STAT_PREFIX => return self.stat(),
            NOBUCKET_UPLOAD_PREFIX => {
                if rest.is_empty() {
                    return error_response(&Error::bad_request(
                        preq.url(),
                        "could not split path to /handler/key, there must be at least 2 slashes",
                    ));
                }
                return self.nobucket_upload(&rest, &preq, body, &host).await;
            }
            BULK_DELETE_PREFIX => {
                if rest.is_empty() {
                    return error_response(&Error::bad_request(
                        preq.url(),
                        "could not split path to /handler/bucket, there must be at least 2 slashes",
                    ));
                }
                return self.bulk_delete(&rest, &preq, body).await;
            }
            _ => {}
        }

        let (bucket, key) = match rest.split_once('/') {
            Some((b, k)) if !b.is_empty() && !k.is_empty() => (b.to_string(), k.to_string()),
            _ => {
                return error_response(&Error::bad_request(
                    preq.url(),
                    "could not split path to /handler/bucket/key, there must be at least 3 slashes",
                ))
            }
        };

        match handler.as_str() {
            UPLOAD_PREFIX => self.bucket_upload(&bucket, &key, &preq, body, &host).await,
            GET_PREFIX => self.get(&bucket, &key, &preq).await,
            STREAM_PREFIX => self.stream(&bucket, &key, &preq).await,
            LOOKUP_PREFIX => self.lookup(&bucket, &key, &preq).await,
            DELETE_PREFIX => self.delete(&bucket, &key, &preq).await,
            _ => error_response(&Error::bad_request(
                preq.url(),
                "there is no registered handler for this path",
            )),
        }
    }

    fn local_url(&self, host: &str, operation: &str, bucket: &str, key: &str) -> String {
        format!("http://{}/{}/{}/{}", host, operation, bucket, key)
    }

    fn upload_reply(
        &self,
        host: &str,
        bucket: &str,
        key: &str,
        reply: crate::reply::LookupResult,
    ) -> Response<BoxBody> {
        let envelope = UploadReply {
            bucket: bucket.to_string(),
            primary: UploadEntReply {
                key: key.to_string(),
                get: format!("GET {}", self.local_url(host, GET_PREFIX, bucket, key)),
                update: format!("POST {}", self.local_url(host, UPLOAD_PREFIX, bucket, key)),
                delete: format!("POST {}", self.local_url(host, DELETE_PREFIX, bucket, key)),
            },
            reply,
        };

        json_response(StatusCode::OK, &envelope)
    }

    async fn nobucket_upload(
        &self,
        key: &str,
        preq: &ProxyRequest,
        body: Bytes,
        host: &str,
    ) -> Response<BoxBody> {
        match self.ctl.upload(key, preq, body).await {
            Ok((reply, bucket)) => self.upload_reply(host, bucket.name(), key, reply),
            Err(e) => error_response(&e),
        }
    }

    async fn bucket_upload(
        &self,
        bucket: &str,
        key: &str,
        preq: &ProxyRequest,
        body: Bytes,
        host: &str,
    ) -> Response<BoxBody> {
        match self.ctl.bucket_upload_named(bucket, key, preq, body).await {
            Ok((reply, b)) => self.upload_reply(host, b.name(), key, reply),
            Err(e) => error_response(&e),
        }
    }

    async fn get(&self, bucket: &str, key: &str, preq: &ProxyRequest) -> Response<BoxBody> {
        match self.ctl.get(bucket, key, preq).await {
            Ok(data) => bytes_response(StatusCode::OK, data),
            Err(e) => error_response(&e),
        }
    }

    async fn stream(&self, bucket: &str, key: &str, preq: &ProxyRequest) -> Response<BoxBody> {
        match self.ctl.stream(bucket, key, preq).await {
            Ok(data) => bytes_response(StatusCode::OK, data),
            Err(e) => error_response(&e),
        }
    }

    async fn lookup(&self, bucket: &str, key: &str, preq: &ProxyRequest) -> Response<BoxBody> {
        match self.ctl.lookup(bucket, key, preq).await {
            Ok(reply) => json_response(StatusCode::OK, &reply),
            Err(e) => error_response(&e),
        }
    }

    async fn delete(&self, bucket: &str, key: &str, preq: &ProxyRequest) -> Response<BoxBody> {
        match self.ctl.remove(bucket, key, preq).await {
            Ok(()) => plain_response(StatusCode::OK, String::new()),
            Err(e) => error_response(&e),
        }
    }

    async fn bulk_delete(&self, bucket: &str, preq: &ProxyRequest, body: Bytes) -> Response<BoxBody> {
        if preq.method != Method::POST {
            return error_response(&Error::bad_request(preq.url(), "bulk_delete requires POST"));
        }

        let parsed: BulkDeleteRequest = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => {
                return error_response(&Error::bad_request(
                    preq.url(),
                    format!("bulk_delete: could not parse keys: {}", e),
                ))
            }
        };

        match self.ctl.bulk_remove(bucket, &parsed.keys, preq).await {
            Ok(failed) => json_response(StatusCode::OK, &failed),
            Err(e) => error_response(&e),
        }
    }

    /// Writable bucket list; doubles as the liveness probe.
    fn ping(&self) -> Response<BoxBody> {
        let metas: Vec<_> =
            self.ctl.registry().writable().iter().map(|b| b.meta.clone()).collect();
        json_response(StatusCode::OK, &metas)
    }

    fn stat(&self) -> Response<BoxBody> {
        json_response(StatusCode::OK, &self.ctl.stat_reply())
    }
}

fn string_body(s: String) -> BoxBody {
    use http_body_util::Full;
    Full::new(Bytes::from(s)).map_err(|never| match never {}).boxed()
}

fn bytes_body(b: Bytes) -> BoxBody {
    use http_body_util::Full;
    Full::new(b).map_err(|never| match never {}).boxed()
}

fn plain_response(status: StatusCode, message: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(string_body(message))
        .expect("static response parts are valid")
}

fn bytes_response(status: StatusCode, data: Bytes) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/octet-stream")
        .body(bytes_body(data))
        .expect("static response parts are valid")
}

fn json_response<S: serde::Serialize>(status: StatusCode, value: &S) -> Response<BoxBody> {
    match serde_json::to_vec(value) {
        Ok(data) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(bytes_body(Bytes::from(data)))
            .expect("static response parts are valid"),
        Err(e) => plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("reply serialization failed: {}", e),
        ),
    }
}

fn error_response(error: &Error) -> Response<BoxBody> {
    plain_response(error.status(), error.data())
}
