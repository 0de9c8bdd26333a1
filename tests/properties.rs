#[cfg(test)]
mod properties {
    use std::collections::HashMap;
    use std::io::{Read as _, Write as _};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use http::StatusCode;
    use pretty_assertions::assert_eq;
    use url::Url;

    use trawl::{
        Client, ClientBuilder, ConcurrencyMode, ErrorGroup, ErrorKind, FetchRequest, FetchResult,
        Priority, Resolve, ServerPolicy, Status,
    };

    const RESULT_WAIT: Duration = Duration::from_secs(10);

    /// Serialize an HTTP/1.1 response with a `Content-Length` header.
    fn http_response(code: u16, reason: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 {code} {reason}\r\n").into_bytes();
        for (name, value) in headers {
            response.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        response.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        response.extend_from_slice(body);
        response
    }

    /// A canned-response HTTP server on a loopback port.
    ///
    /// Beyond serving scripted responses it keeps the observables these
    /// tests are about: which requests arrived when, and how many were
    /// being served at the same time.
    struct MockServer {
        addr: SocketAddr,
        requests: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        peak_in_flight: Arc<AtomicUsize>,
    }

    impl MockServer {
        /// Serve `response` to every request, on every connection.
        fn respond_with(response: Vec<u8>) -> Self {
            Self::start(Duration::ZERO, move |_| Some(response.clone()))
        }

        /// Same, but sit on each request for `delay` before answering.
        fn respond_slowly(delay: Duration, response: Vec<u8>) -> Self {
            Self::start(delay, move |_| Some(response.clone()))
        }

        /// Serve scripted responses in request order, across
        /// connections. Once the script runs out, connections close
        /// without a response.
        fn respond_in_order(responses: Vec<Vec<u8>>) -> Self {
            let script = Mutex::new(std::collections::VecDeque::from(responses));
            Self::start(Duration::ZERO, move |_| script.lock().unwrap().pop_front())
        }

        fn start(delay: Duration, next: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak_in_flight = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&requests);
            let live = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak_in_flight);
            let next = Arc::new(next);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let next = Arc::clone(&next);
                    let seen = Arc::clone(&seen);
                    let live = Arc::clone(&live);
                    let peak = Arc::clone(&peak);
                    thread::spawn(move || serve(stream, delay, &*next, &seen, &live, &peak));
                }
            });
            Self {
                addr,
                requests,
                peak_in_flight,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.addr
        }

        /// Base URL of the server.
        fn url(&self) -> Url {
            Url::parse(&format!("http://{}/", self.addr)).unwrap()
        }

        /// URL of `path` on the server.
        fn url_for(&self, path: &str) -> Url {
            self.url().join(path).unwrap()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        /// Request paths in arrival order.
        fn paths(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|(_, request)| {
                    let line = request.split(|&b| b == b'\r').next().unwrap_or(&[]);
                    String::from_utf8_lossy(line)
                        .split(' ')
                        .nth(1)
                        .unwrap_or("")
                        .to_string()
                })
                .collect()
        }

        /// Arrival instants of the requests, in order.
        fn request_times(&self) -> Vec<Instant> {
            self.requests.lock().unwrap().iter().map(|(at, _)| *at).collect()
        }

        /// Most requests that were ever being served at the same time.
        fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    /// Answer requests on one connection until the script runs out, the
    /// response says `Connection: close`, or the peer hangs up.
    fn serve(
        mut stream: TcpStream,
        delay: Duration,
        next: &dyn Fn(&[u8]) -> Option<Vec<u8>>,
        seen: &Mutex<Vec<(Instant, Vec<u8>)>>,
        live: &AtomicUsize,
        peak: &AtomicUsize,
    ) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let head_end = loop {
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            let request: Vec<u8> = buf.drain(..head_end).collect();
            seen.lock().unwrap().push((Instant::now(), request.clone()));
            let now_serving = live.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now_serving, Ordering::SeqCst);
            thread::sleep(delay);
            let response = next(&request);
            let done = match &response {
                Some(response) => stream.write_all(response).is_err() || wants_close(response),
                None => true,
            };
            live.fetch_sub(1, Ordering::SeqCst);
            if done {
                return;
            }
        }
    }

    fn wants_close(response: &[u8]) -> bool {
        response
            .windows(17)
            .any(|w| w.eq_ignore_ascii_case(b"connection: close"))
    }

    /// Resolves every name to one fixed address.
    #[derive(Debug)]
    struct StaticResolver(SocketAddr);

    impl Resolve for StaticResolver {
        fn resolve(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>, String> {
            Ok(vec![self.0])
        }
    }

    fn collect_results(client: &Client, n: usize) -> Vec<FetchResult> {
        (0..n)
            .map(|_| {
                client
                    .result_timeout(RESULT_WAIT)
                    .expect("engine did not produce a result in time")
            })
            .collect()
    }

    #[test]
    fn test_serial_server_never_runs_two_exchanges_at_once() {
        let server = MockServer::respond_slowly(
            Duration::from_millis(100),
            http_response(200, "OK", &[("Connection", "close")], b"ok"),
        );
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .server_policy(ServerPolicy {
                concurrency: ConcurrencyMode::Serial,
                ..ServerPolicy::default()
            })
            .build()
            .client()
            .unwrap();
        for path in ["/a", "/b", "/c"] {
            client
                .put_request(FetchRequest::new(server.url_for(path)))
                .unwrap();
        }
        let results = collect_results(&client, 3);
        assert!(results.iter().all(FetchResult::is_success));
        assert_eq!(server.request_count(), 3);
        assert_eq!(server.peak_in_flight(), 1);
    }

    #[test]
    fn test_unlimited_server_runs_exchanges_in_parallel() {
        let server = MockServer::respond_slowly(
            Duration::from_millis(200),
            http_response(200, "OK", &[("Connection", "close")], b"ok"),
        );
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .server_policy(ServerPolicy {
                concurrency: ConcurrencyMode::Unlimited,
                ..ServerPolicy::default()
            })
            .build()
            .client()
            .unwrap();
        for path in ["/a", "/b", "/c"] {
            client
                .put_request(FetchRequest::new(server.url_for(path)))
                .unwrap();
        }
        let results = collect_results(&client, 3);
        assert!(results.iter().all(FetchResult::is_success));
        assert!(
            server.peak_in_flight() >= 2,
            "expected overlapping exchanges, peak was {}",
            server.peak_in_flight()
        );
    }

    #[test]
    fn test_higher_priority_dispatches_first() {
        let server = MockServer::respond_with(http_response(200, "OK", &[], b"ok"));
        let client = ClientBuilder::builder()
            .host_interval(Duration::from_millis(150))
            .build()
            .client()
            .unwrap();
        // The first request starts the politeness clock; the rest queue
        // up behind it and must leave in priority order, FIFO within a
        // level.
        client
            .put_request(FetchRequest::new(server.url_for("/first")))
            .unwrap();
        client
            .put_request(FetchRequest::new(server.url_for("/low")).with_priority(Priority::LOWEST))
            .unwrap();
        client
            .put_request(FetchRequest::new(server.url_for("/mid")))
            .unwrap();
        client
            .put_request(
                FetchRequest::new(server.url_for("/high")).with_priority(Priority::HIGHEST),
            )
            .unwrap();
        let results = collect_results(&client, 4);
        assert!(results.iter().all(FetchResult::is_success));
        assert_eq!(server.paths(), vec!["/first", "/high", "/mid", "/low"]);
    }

    #[test]
    fn test_redirect_chain_is_followed_and_counted() {
        let server = MockServer::respond_in_order(vec![
            http_response(302, "Found", &[("Location", "/hop1")], b""),
            http_response(301, "Moved Permanently", &[("Location", "/hop2")], b""),
            http_response(307, "Temporary Redirect", &[("Location", "/hop3")], b""),
            http_response(200, "OK", &[], b"done"),
        ]);
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .build()
            .client()
            .unwrap();
        client
            .put_request(FetchRequest::new(server.url_for("/start")))
            .unwrap();
        let result = collect_results(&client, 1).remove(0);
        assert!(result.is_success(), "status: {}", result.status);
        assert_eq!(result.redirect_count(), 3);
        assert_eq!(
            result.redirects,
            vec![
                server.url_for("/hop1"),
                server.url_for("/hop2"),
                server.url_for("/hop3"),
            ]
        );
        assert_eq!(result.final_url(), &server.url_for("/hop3"));
        assert_eq!(server.paths(), vec!["/start", "/hop1", "/hop2", "/hop3"]);
    }

    #[test]
    fn test_redirect_ceiling_fails_the_fetch() {
        let server = MockServer::respond_with(http_response(
            301,
            "Moved Permanently",
            &[("Location", "/loop")],
            b"",
        ));
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .max_redirects(2u32)
            .build()
            .client()
            .unwrap();
        client
            .put_request(FetchRequest::new(server.url_for("/start")))
            .unwrap();
        let result = collect_results(&client, 1).remove(0);
        assert_eq!(result.status, Status::Error(ErrorKind::TooManyRedirects(2)));
        // Two hops were followed; the third redirecting response hit
        // the ceiling before being followed.
        assert_eq!(result.redirect_count(), 2);
        assert_eq!(server.request_count(), 3);
    }

    #[test]
    fn test_error_rate_trips_breaker_and_fails_queued() {
        let server =
            MockServer::respond_with(http_response(500, "Internal Server Error", &[], b"boom"));
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .server_policy(ServerPolicy {
                concurrency: ConcurrencyMode::Serial,
                max_error_rate: 0.5,
                error_window: 10,
            })
            .build()
            .client()
            .unwrap();
        for i in 0..8 {
            client
                .put_request(FetchRequest::new(server.url_for(&format!("/{i}"))))
                .unwrap();
        }
        let results = collect_results(&client, 8);
        // Six failures out of a window of ten push the error rate over
        // one half; the sixth completion trips the breaker and the two
        // still-queued requests never reach the network.
        let served = results
            .iter()
            .filter(|r| {
                matches!(
                    &r.status,
                    Status::Error(ErrorKind::Http(code))
                        if *code == StatusCode::INTERNAL_SERVER_ERROR
                )
            })
            .count();
        let disabled: Vec<&FetchResult> = results
            .iter()
            .filter(|r| matches!(&r.status, Status::Error(ErrorKind::ServerDisabled)))
            .collect();
        assert_eq!(served, 6);
        assert_eq!(disabled.len(), 2);
        for result in disabled {
            let Status::Error(kind) = &result.status else {
                unreachable!();
            };
            assert_eq!(kind.group(), ErrorGroup::Server);
        }
        assert_eq!(server.request_count(), 6);
    }

    #[test]
    fn test_whole_fetch_deadline_fires_in_queue() {
        let server = MockServer::respond_with(http_response(200, "OK", &[], b"ok"));
        let client = ClientBuilder::builder()
            .host_interval(Duration::from_secs(60))
            .timeout(Duration::from_secs(1))
            .build()
            .client()
            .unwrap();
        let first = client
            .put_request(FetchRequest::new(server.url_for("/now")))
            .unwrap();
        let second = client
            .put_request(FetchRequest::new(server.url_for("/starved")))
            .unwrap();
        let started = Instant::now();
        let results = collect_results(&client, 2);
        let elapsed = started.elapsed();
        let starved = results.iter().find(|r| r.id == second).unwrap();
        assert_eq!(
            starved.status,
            Status::Error(ErrorKind::QueuedTimeout(Duration::from_secs(1)))
        );
        let Status::Error(kind) = &starved.status else {
            unreachable!();
        };
        assert_eq!(kind.group(), ErrorGroup::Rule);
        assert!(results.iter().find(|r| r.id == first).unwrap().is_success());
        // The deadline fired from the queue, long before the politeness
        // clock would have allowed a dispatch.
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn test_evicted_idle_host_comes_back_fresh() {
        let server = MockServer::respond_with(http_response(200, "OK", &[], b"ok"));
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver(server.addr()));
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .host_intervals(HashMap::from([(
                "a.test".to_string(),
                Duration::from_secs(10),
            )]))
            .host_cache_limit(1usize)
            .resolver(resolver)
            .build()
            .client()
            .unwrap();
        client
            .put_request(FetchRequest::try_from("http://a.test/one").unwrap())
            .unwrap();
        assert!(collect_results(&client, 1)[0].is_success());
        // A second host pushes the record count over the cache limit;
        // the idle first host is evicted when this fetch completes.
        client
            .put_request(FetchRequest::try_from("http://b.test/two").unwrap())
            .unwrap();
        assert!(collect_results(&client, 1)[0].is_success());
        // Had the first host record survived, its politeness clock
        // would hold this fetch for ten seconds. The recreated record
        // starts fresh and dispatches immediately.
        client
            .put_request(FetchRequest::try_from("http://a.test/three").unwrap())
            .unwrap();
        let result = client
            .result_timeout(Duration::from_secs(3))
            .expect("evicted host must come back with a fresh politeness clock");
        assert!(result.is_success());
        assert_eq!(server.request_count(), 3);
    }

    #[test]
    fn test_plain_http_rides_proxy_in_absolute_form() {
        let proxy = MockServer::respond_with(http_response(200, "OK", &[], b"proxied"));
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .proxy(proxy.url())
            .build()
            .client()
            .unwrap();
        client
            .put_request(FetchRequest::try_from("http://origin.test/page").unwrap())
            .unwrap();
        let result = collect_results(&client, 1).remove(0);
        assert!(result.is_success(), "status: {}", result.status);
        assert_eq!(proxy.paths(), vec!["http://origin.test/page"]);
        let requests = proxy.requests.lock().unwrap();
        let head = String::from_utf8_lossy(&requests[0].1);
        assert!(head.contains("Host: origin.test\r\n"), "head was: {head}");
    }

    #[test]
    fn test_serialized_host_spaces_requests_by_completion() {
        let delay = Duration::from_millis(150);
        let server =
            MockServer::respond_slowly(delay, http_response(200, "OK", &[], b"slow"));
        let client = ClientBuilder::builder()
            .host_interval(Duration::ZERO)
            .server_policy(ServerPolicy {
                concurrency: ConcurrencyMode::Serial,
                ..ServerPolicy::default()
            })
            .build()
            .client()
            .unwrap();
        client
            .put_request(FetchRequest::new(server.url_for("/x")))
            .unwrap();
        client
            .put_request(FetchRequest::new(server.url_for("/y")))
            .unwrap();
        let results = collect_results(&client, 2);
        assert!(results.iter().all(FetchResult::is_success));
        // The second request cannot leave before the first exchange
        // released its connection, so its arrival trails the first by
        // at least the server's service time.
        let times = server.request_times();
        assert_eq!(times.len(), 2);
        assert!(
            times[1].duration_since(times[0]) >= delay,
            "second request arrived {:?} after the first",
            times[1].duration_since(times[0])
        );
        assert_eq!(server.peak_in_flight(), 1);
    }
}
