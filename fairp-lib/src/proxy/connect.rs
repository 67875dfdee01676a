use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpStream, lookup_host};
use uuid::Uuid;

use super::{Proxy, ProxyBody, ProxyOptions, empty, error_response};
use crate::ratelimit::HostKey;
use crate::{ErrorKind, Result};

/// Connect to `destination` (`host:port`) within the dial timeout
async fn dial(destination: &str, options: &ProxyOptions) -> Result<TcpStream> {
    let dial_error = |source| ErrorKind::Dial {
        destination: destination.to_string(),
        source,
    };

    let connect = async {
        if !options.no_ipv4 {
            return TcpStream::connect(destination).await.map_err(dial_error);
        }

        let addrs: Vec<SocketAddr> = lookup_host(destination)
            .await
            .map_err(dial_error)?
            .filter(SocketAddr::is_ipv6)
            .collect();
        if addrs.is_empty() {
            return Err(ErrorKind::NoIpv6Address(destination.to_string()));
        }
        TcpStream::connect(addrs.as_slice()).await.map_err(dial_error)
    };

    tokio::time::timeout(options.dial_timeout, connect)
        .await
        .map_err(|_| ErrorKind::DialTimeout(destination.to_string()))?
}

/// Answer a `CONNECT` request and relay the upgraded connection.
///
/// The destination is dialed before the client gets its `200`, so a
/// destination that cannot be reached costs no limiter capacity.
pub(super) async fn tunnel(
    proxy: &Proxy,
    req: Request<Incoming>,
    trace_id: Uuid,
    remote_host: HostKey,
) -> Response<ProxyBody> {
    let request = proxy.runner.track_request();

    let Some(destination) = req.uri().authority().map(ToString::to_string) else {
        let err = ErrorKind::MissingDestination(req.uri().to_string());
        log::info!("Rejected tunnel trace_id={trace_id} error={err}");
        return error_response(err.status(), &err);
    };

    let destination_stream = match dial(&destination, &proxy.options).await {
        Ok(stream) => stream,
        Err(err) => {
            log::info!("Error dialing destination trace_id={trace_id} destination={destination} error={err}");
            return error_response(err.status(), &err);
        }
    };

    let runner = Arc::clone(&proxy.runner);
    tokio::spawn(async move {
        let _request = request;
        let client = match hyper::upgrade::on(req).await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                let err = ErrorKind::Upgrade(e);
                log::info!("Upgrade failed trace_id={trace_id} destination={destination} error={err}");
                return;
            }
        };

        log::info!(
            "Tunnel established trace_id={trace_id} remote_host={remote_host} destination={destination}"
        );
        let report = runner
            .tunnel(client, destination_stream, &remote_host)
            .await;

        if let Some(err) = &report.send_error {
            log::info!(
                "Error relaying client to destination trace_id={trace_id} destination={destination} error={err}"
            );
        }
        if let Some(err) = &report.recv_error {
            log::info!(
                "Error relaying destination to client trace_id={trace_id} destination={destination} error={err}"
            );
        }
        log::info!(
            "Tunnel closed trace_id={trace_id} remote_host={remote_host} destination={destination} bytes_sent={} bytes_received={}",
            report.sent,
            report.received,
        );
    });

    empty(StatusCode::OK)
}
