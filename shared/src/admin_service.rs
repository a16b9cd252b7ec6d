use crate::http::{make_boxed_error_response, make_boxed_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// What the admin listener needs to know about the running service.
pub trait AdminProbe: Send + Sync + 'static {
    fn is_ready(&self) -> bool;

    /// Gauges rendered one per line on `/status` as `name value`.
    fn status(&self) -> Vec<(&'static str, u64)>;
}

/// Serves `/health`, `/ready` and `/status` on the admin listener.
pub struct AdminService<P, E> {
    probe: Arc<P>,
    _error: PhantomData<E>,
}

impl<P, E> AdminService<P, E>
where
    P: AdminProbe,
{
    pub fn new(probe: Arc<P>) -> Self {
        Self {
            probe,
            _error: PhantomData,
        }
    }
}

impl<P, E> Service<Request<Incoming>> for AdminService<P, E>
where
    P: AdminProbe,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route(self.probe.as_ref(), req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}

fn route<P: AdminProbe>(probe: &P, path: &str) -> Response<BoxBody<Bytes, Infallible>> {
    match path {
        "/health" => make_boxed_response(StatusCode::OK, "ok\n"),
        "/ready" => match probe.is_ready() {
            true => make_boxed_response(StatusCode::OK, "ok\n"),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        "/status" => {
            let body: String = probe
                .status()
                .into_iter()
                .map(|(name, value)| format!("{name} {value}\n"))
                .collect();
            make_boxed_response(StatusCode::OK, body)
        }
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}
