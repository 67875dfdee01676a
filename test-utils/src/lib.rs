//! `test-utils` is used for testing in both `fairp-lib` and `fairp-bin`.
//! This crate does not depend on `fairp-lib` or `fairp-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies.

/// Create a mock web server, which responds with a predefined status when
/// handling a matching request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Start a TCP server on an ephemeral local port that echoes every byte
/// back to the sender. Evaluates to the server's address.
#[macro_export]
macro_rules! echo_server {
    () => {{
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }};
}

/// Start a fairp proxy on an ephemeral local port.
///
/// Takes the maximum throughput in bytes per second, and optionally a
/// `fairp_lib::ratelimit::RateLimitConfig` modifier closure. Evaluates to
/// `(address, runner)`.
#[macro_export]
macro_rules! fairp_proxy {
    ($max_throughput:expr) => {
        $crate::fairp_proxy!($max_throughput, |config| config)
    };
    ($max_throughput:expr, $configure:expr) => {{
        let config = fairp_lib::ratelimit::RateLimitConfig::new($max_throughput);
        let config = ($configure)(config);
        let runner = std::sync::Arc::new(fairp_lib::Runner::new(config).unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = fairp_lib::proxy::Proxy::new(
            std::sync::Arc::clone(&runner),
            fairp_lib::proxy::ProxyOptions::default(),
        )
        .unwrap();
        tokio::spawn(proxy.serve(listener));
        (addr, runner)
    }};
}

/// Build a `reqwest::Client` that sends every request through the proxy
/// listening on the given address
#[macro_export]
macro_rules! proxied_client {
    ($proxy_addr:expr) => {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", $proxy_addr)).unwrap())
            .build()
            .unwrap()
    };
}
