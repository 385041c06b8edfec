//! Body type shared by every pipeline stage

use bytes::Bytes;
use http::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;

/// Request and response body flowing through hooks
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn incoming(body: Incoming) -> ProxyBody {
    body.boxed()
}

/// Run `on_error` when the body fails mid-stream
pub fn watch_errors<F>(body: ProxyBody, on_error: F) -> ProxyBody
where
    F: Fn(&hyper::Error) + Send + Sync + 'static,
{
    body.map_err(move |e| {
        on_error(&e);
        e
    })
    .boxed()
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Same as [`text_response`] but asks the client to drop the connection
pub fn closing_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = text_response(status, message);
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
