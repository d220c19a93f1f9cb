#[cfg(unix)]
mod cgi_gateway {
    use hyper::{Body, Request, Response, StatusCode};
    use prism_core::config::{ApplicationConfig, Config, PathInvocationConfig};
    use prismd::dispatcher::Dispatcher;
    use prismd::request::GatewayRequest;
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::watch;

    fn write_script(path: &Path, body: &str) -> PathBuf {
        std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_path_buf()
    }

    fn request(method: &str, uri: &str, body: &'static str) -> GatewayRequest {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "gateway.test:8080")
            .header("x-trace", "abc");
        if !body.is_empty() {
            builder = builder.header("content-length", body.len().to_string());
        }
        GatewayRequest::from_hyper(
            builder.body(Body::from(body)).unwrap(),
            Some("198.51.100.4:50500".parse().unwrap()),
            Some("127.0.0.1:8080".parse().unwrap()),
        )
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    const ENV_SCRIPT: &str = "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
        for name in GATEWAY_INTERFACE SCRIPT_NAME PATH_INFO QUERY_STRING SERVER_NAME \
        REQUEST_URI HTTP_X_TRACE APP_MODE CONTENT_LENGTH; do\n\
        eval \"printf '%s=%s\\n' $name \\\"\\$$name\\\"\"\n\
        done\n\
        cat\n";

    fn env_lines(text: &str) -> HashMap<String, String> {
        text.lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn named_cgi_application_on_path_prefix() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let script = write_script(&bin.path().join("app.sh"), ENV_SCRIPT);
        let config = Config {
            document_root: root.path().to_path_buf(),
            port: 8080,
            invoke_on_path: vec![PathInvocationConfig {
                prefix: "/app/".into(),
                application: "shell".into(),
            }],
            cgi_applications: HashMap::from([(
                "shell".to_string(),
                ApplicationConfig {
                    path: script,
                    arguments: vec![],
                    environment: HashMap::from([("APP_MODE".to_string(), "test".to_string())]),
                },
            )]),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(config)).unwrap();
        dispatcher.initialize().await.unwrap();

        let response = dispatcher
            .dispatch(request("POST", "/app/orders?page=2", "body!"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/plain");
        let text = body_text(response).await;
        let vars = env_lines(&text);
        assert_eq!(vars["GATEWAY_INTERFACE"], "CGI/1.1");
        assert_eq!(vars["SCRIPT_NAME"], "/app/orders");
        assert_eq!(vars["QUERY_STRING"], "page=2");
        assert_eq!(vars["SERVER_NAME"], "gateway.test");
        assert_eq!(vars["REQUEST_URI"], "/app/orders?page=2");
        assert_eq!(vars["HTTP_X_TRACE"], "abc");
        assert_eq!(vars["APP_MODE"], "test");
        assert_eq!(vars["CONTENT_LENGTH"], "5");
        assert!(text.ends_with("body!"), "{text}");
    }

    #[tokio::test]
    async fn cgi_bin_script_with_path_info() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("cgi-bin")).unwrap();
        write_script(&root.path().join("cgi-bin/env.sh"), ENV_SCRIPT);
        let config = Config {
            document_root: root.path().to_path_buf(),
            port: 8080,
            enable_cgi_bin: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(config)).unwrap();

        let response = dispatcher
            .dispatch(request("GET", "/cgi-bin/env.sh/users/7?full=1", ""))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let vars = env_lines(&body_text(response).await);
        assert_eq!(vars["SCRIPT_NAME"], "/cgi-bin/env.sh");
        assert_eq!(vars["PATH_INFO"], "/users/7");
        assert_eq!(vars["REQUEST_URI"], "/cgi-bin/env.sh/users/7?full=1");
        assert_eq!(vars["CONTENT_LENGTH"], "");

        let missing = dispatcher
            .dispatch(request("GET", "/cgi-bin/nothing.sh", ""))
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_header_and_stderr_from_script() {
        let root = tempfile::tempdir().unwrap();
        write_script(
            &root.path().join("gone.cgi"),
            "echo 'something went sideways' >&2\n\
             printf 'Status: 410 Gone\\r\\nContent-Type: text/html\\r\\n\
             X-Reason: expired\\r\\n\\r\\n<p>gone</p>'\n",
        );
        let config = Config {
            document_root: root.path().to_path_buf(),
            cgi_extension: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(config)).unwrap();

        let response = dispatcher.dispatch(request("GET", "/gone.cgi", "")).await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(response.headers()["x-reason"], "expired");
        assert_eq!(response.headers()["content-length"], "11");
        assert_eq!(body_text(response).await, "<p>gone</p>");
    }

    #[tokio::test]
    async fn failing_handler_gives_500_and_dispatcher_keeps_serving() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("ok.txt"), "still here").unwrap();
        let config = Config {
            document_root: root.path().to_path_buf(),
            invoke_on_extension: HashMap::from([("py".to_string(), "python".to_string())]),
            cgi_applications: HashMap::from([(
                "python".to_string(),
                ApplicationConfig {
                    path: PathBuf::from("/nonexistent/python-cgi"),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(config)).unwrap();

        let failed = dispatcher.dispatch(request("GET", "/script.py", "")).await;
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.headers()["content-type"], "text/html; charset=UTF-8");
        let page = body_text(failed).await;
        assert!(page.contains("failed to start CGI application /nonexistent/python-cgi"), "{page}");
        assert!(page.contains("<pre>"), "{page}");

        let ok = dispatcher.dispatch(request("GET", "/ok.txt", "")).await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_text(ok).await, "still here");
    }

    #[tokio::test]
    async fn bare_newline_output_loses_body_bytes() {
        let root = tempfile::tempdir().unwrap();
        write_script(
            &root.path().join("lf.cgi"),
            "printf 'Content-Type: text/plain\\n\\nHello'\n",
        );
        let config = Config {
            document_root: root.path().to_path_buf(),
            cgi_extension: true,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(config)).unwrap();
        let response = dispatcher.dispatch(request("GET", "/lf.cgi", "")).await;
        assert_eq!(body_text(response).await, "llo");
    }

    #[tokio::test]
    async fn script_reason_phrase_reaches_the_status_line() {
        let root = tempfile::tempdir().unwrap();
        write_script(
            &root.path().join("fishing.cgi"),
            "printf 'Status: 404 Gone Fishing\\r\\n\
             Content-Type: text/plain\\r\\n\\r\\nback soon'\n",
        );
        let config = Config {
            document_root: root.path().to_path_buf(),
            cgi_extension: true,
            ..Default::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(config)).unwrap());
        let listener = prismd::listener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop, stopped) = watch::channel(false);
        let server = tokio::spawn(prismd::listener::serve(listener, dispatcher, stopped));

        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream
            .write_all(b"GET /fishing.cgi HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply.lines().next(), Some("HTTP/1.1 404 Gone Fishing"));
        assert!(reply.ends_with("back soon"), "{reply}");

        stop.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
