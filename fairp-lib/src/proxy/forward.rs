use futures::TryStreamExt;
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use std::io;
use std::sync::Arc;
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use super::{Proxy, ProxyBody, error_response};
use crate::ErrorKind;
use crate::ratelimit::HostKey;

/// Capacity of the pipe between the rate limited copy and the response body
const BODY_PIPE_CAPACITY: usize = 64 * 1024;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// Forward a plain HTTP request and stream the response back.
///
/// Only the response body is rate limited; the request body is passed
/// upstream as it arrives.
pub(super) async fn forward(
    proxy: &Proxy,
    req: Request<Incoming>,
    trace_id: Uuid,
    remote_host: HostKey,
) -> Response<ProxyBody> {
    let request = proxy.runner.track_request();
    let url = req.uri().to_string();

    if req.uri().host().is_none() {
        let err = ErrorKind::MissingDestination(url);
        log::info!("Rejected request trace_id={trace_id} error={err}");
        return error_response(err.status(), &err);
    }

    log::info!("Handling HTTP request trace_id={trace_id} remote_host={remote_host} url={url}");

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    let upstream = proxy
        .client
        .request(parts.method, url.as_str())
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            let err = ErrorKind::from(e);
            log::info!("Upstream request failed trace_id={trace_id} url={url} error={err}");
            return error_response(err.status(), &err);
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let source = StreamReader::new(Box::pin(upstream.bytes_stream().map_err(io::Error::other)));
    let (mut pipe, body_reader) = tokio::io::duplex(BODY_PIPE_CAPACITY);

    let runner = Arc::clone(&proxy.runner);
    tokio::spawn(async move {
        let _request = request;
        match runner.copy_recv(&mut pipe, source, &remote_host).await {
            Ok(received) => log::info!(
                "HTTP response forwarded trace_id={trace_id} remote_host={remote_host} url={url} bytes_received={received}"
            ),
            Err(err) => log::info!(
                "Error copying response body trace_id={trace_id} remote_host={remote_host} url={url} error={err}"
            ),
        }
    });

    let body = StreamBody::new(ReaderStream::new(body_reader).map_ok(Frame::data));
    let mut response = Response::new(BodyExt::boxed(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::PROXY_AUTHORIZATION, "Basic Zm9vOmJhcg==".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/html".parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, "42".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[header::CONTENT_TYPE], "text/html");
        assert_eq!(headers[header::CONTENT_LENGTH], "42");
    }
}
