#[cfg(test)]
mod proxy {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use fairp_lib::Result;
    use http::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MIB: f64 = 1024.0 * 1024.0;

    /// Send a `CONNECT` for `destination` and return the stream together
    /// with the response head
    async fn connect(proxy: SocketAddr, destination: SocketAddr) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let request = format!("CONNECT {destination} HTTP/1.1\r\nHost: {destination}\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_eq!(n, 1, "proxy closed the connection mid-response");
            head.push(byte[0]);
        }
        (stream, String::from_utf8(head).unwrap())
    }

    #[tokio::test]
    async fn test_register() -> Result<()> {
        let (addr, _runner) = test_utils::fairp_proxy!(MIB);

        let response = reqwest::get(format!("http://{addr}/register")).await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await?, "Thank you for registering :)\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_health_reports_stats() -> Result<()> {
        let (addr, _runner) = test_utils::fairp_proxy!(MIB);

        let response = reqwest::get(format!("http://{addr}/health")).await?;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.text().await?;
        for key in [
            "UploadSpeed:",
            "DownloadSpeed:",
            "GuaranteedThroughput(send):",
            "GuaranteedThroughput(recv):",
            "BytesSent: 0",
            "BytesReceived: 0",
            "NumConcurrentRequests: 0",
        ] {
            assert!(body.contains(key), "missing `{key}` in:\n{body}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_health_burst_is_not_throttled() -> Result<()> {
        let (addr, _runner) = test_utils::fairp_proxy!(MIB);

        let start = Instant::now();
        for _ in 0..3 {
            let response = reqwest::get(format!("http://{addr}/health")).await?;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert!(start.elapsed() < Duration::from_millis(900));
        Ok(())
    }

    #[tokio::test]
    async fn test_health_hammering_is_refused() -> Result<()> {
        let (addr, _runner) = test_utils::fairp_proxy!(MIB);
        let url = format!("http://{addr}/health");

        let responses =
            futures::future::join_all((0..10).map(|_| reqwest::get(url.as_str()))).await;
        let mut statuses = Vec::new();
        for response in responses {
            statuses.push(response?.status());
        }

        let granted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
        let refused = statuses
            .iter()
            .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
            .count();
        // Three from the burst plus at most one per second of allowed waiting
        assert!((3..=6).contains(&granted), "{statuses:?}");
        assert_eq!(granted + refused, statuses.len(), "{statuses:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_http() -> Result<()> {
        let mock_server = test_utils::mock_server!(StatusCode::OK, set_body_string("hello"));
        let (addr, runner) = test_utils::fairp_proxy!(MIB);
        let client = test_utils::proxied_client!(addr);

        let response = client.get(mock_server.uri()).send().await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await?, "hello");
        assert_eq!(runner.stats().bytes_received, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_keeps_upstream_status() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&mock_server)
            .await;
        let (addr, _runner) = test_utils::fairp_proxy!(MIB);
        let client = test_utils::proxied_client!(addr);

        let response = client
            .get(format!("{}/missing", mock_server.uri()))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.text().await?, "gone");
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_does_not_follow_redirects() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&mock_server)
            .await;
        let (addr, _runner) = test_utils::fairp_proxy!(MIB);
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{addr}")).unwrap())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let response = client
            .get(format!("{}/old", mock_server.uri()))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/new");
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_throttles_response_body() -> Result<()> {
        let body = vec![b'x'; 256 * 1024];
        let mock_server = test_utils::mock_server!(StatusCode::OK, set_body_bytes(body.clone()));
        let (addr, _runner) = test_utils::fairp_proxy!(128.0 * 1024.0, |mut config: fairp_lib::ratelimit::RateLimitConfig| {
            config.burst_size = 16 * 1024;
            config
        });
        let client = test_utils::proxied_client!(addr);

        let start = Instant::now();
        let received = client.get(mock_server.uri()).send().await?.bytes().await?;
        let elapsed = start.elapsed();

        assert_eq!(received.len(), body.len());
        // The full buckets hand out a head start; the remainder runs at the ceiling.
        assert!(elapsed >= Duration::from_secs(1), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_forward_unreachable_upstream() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let closed = listener.local_addr()?;
        drop(listener);

        let (addr, _runner) = test_utils::fairp_proxy!(MIB);
        let client = test_utils::proxied_client!(addr);

        let response = client.get(format!("http://{closed}/")).send().await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.text().await?.ends_with('\n'));
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_tunnel() -> Result<()> {
        let echo = test_utils::echo_server!();
        let (addr, runner) = test_utils::fairp_proxy!(MIB);

        let (mut stream, head) = connect(addr, echo).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");

        stream.write_all(b"ping").await?;
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        assert_eq!(&reply, b"ping");
        assert_eq!(runner.concurrent_requests(), 1);

        drop(stream);
        for _ in 0..100 {
            if runner.concurrent_requests() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.concurrent_requests(), 0);

        let stats = runner.stats();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.bytes_received, 4);
        assert_eq!(stats.send_hosts, 0);
        assert_eq!(stats.recv_hosts, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_unreachable_destination() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let closed = listener.local_addr()?;
        drop(listener);

        let (addr, runner) = test_utils::fairp_proxy!(MIB);
        let (_stream, head) = connect(addr, closed).await;

        assert!(head.starts_with("HTTP/1.1 503"), "{head}");
        assert_eq!(runner.concurrent_requests(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() -> Result<()> {
        let (addr, runner) = test_utils::fairp_proxy!(MIB);
        let response = reqwest::get(format!("http://{addr}/register")).await?;
        assert_eq!(response.status(), StatusCode::OK);

        runner.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(reqwest::get(format!("http://{addr}/register")).await.is_err());
        Ok(())
    }
}
