use super::{build_app, AppState};
use crate::{
    config::Config,
    locator::{LocatorCodec, ResourceIdentity},
    telegram::{ConnectionPool, PoolSettings, UpstreamError},
    testing::{pattern, MemoryBackend, HOME_PARTITION},
    transfer::{TransferEngine, TransferSettings},
};
use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, Method, Request, Response, StatusCode},
    Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tower::util::ServiceExt as _;

const FILE_SIZE: usize = 2_000_000;
const FILE_NAME: &str = "photo.jpg";
const DELETE_KEY: &str = "delete-secret";
const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
const IDENTITY: ResourceIdentity = ResourceIdentity {
    chat_id: 555,
    message_id: 42,
    is_group: false,
    is_channel: false,
};

struct TestServer {
    app: Router,
    backend: Arc<MemoryBackend>,
    state: AppState,
    codec: LocatorCodec,
    token: String,
    data: Vec<u8>,
}

impl TestServer {
    async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    fn file_uri(&self) -> String {
        format!("/{}/{}", self.token, FILE_NAME)
    }

    fn leased_connections(&self) -> usize {
        self.state
            .engine
            .pool()
            .stats()
            .iter()
            .map(|s| s.leased)
            .sum()
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.security.token_secret = "server test secret".to_string();
    config.security.delete_key = Some(DELETE_KEY.to_string());
    config.telegram.retry_base_delay_ms = 1;
    config.transfer.retry_base_delay_ms = 1;
    config
}

fn server(config: Config) -> TestServer {
    let backend = MemoryBackend::new();
    let data = pattern(FILE_SIZE);
    backend.add_file(IDENTITY, FILE_NAME, "image/jpeg", data.clone(), HOME_PARTITION);

    let pool = ConnectionPool::init(backend.clone(), PoolSettings::from(&config.pool));
    let engine = Arc::new(TransferEngine::new(
        pool,
        TransferSettings::from(&config.transfer),
    ));
    let state = AppState::new(&config, backend.clone(), engine).unwrap();
    let codec = LocatorCodec::new(&config.security.token_secret).unwrap();
    let token = codec.encode(&IDENTITY).unwrap();

    TestServer {
        app: build_app(state.clone()),
        backend,
        state,
        codec,
        token,
        data,
    }
}

fn request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .extension(ConnectInfo(SocketAddr::new(CLIENT, 40_000)))
}

fn get(uri: &str) -> Request<Body> {
    request(Method::GET, uri).body(Body::empty()).unwrap()
}

fn get_range(uri: &str, range: &str) -> Request<Body> {
    request(Method::GET, uri)
        .header(header::RANGE, range)
        .body(Body::empty())
        .unwrap()
}

fn header_str<'a>(resp: &'a Response<Body>, name: header::HeaderName) -> &'a str {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
    to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(resp: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

#[tokio::test]
async fn get_without_range_serves_whole_file() {
    let server = server(test_config());
    let resp = server.send(get(&server.file_uri())).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "2000000");
    assert_eq!(header_str(&resp, header::CONTENT_TYPE), "image/jpeg");
    assert_eq!(header_str(&resp, header::ACCEPT_RANGES), "bytes");
    assert_eq!(header_str(&resp, header::ACCESS_CONTROL_ALLOW_ORIGIN), "*");
    assert_eq!(
        header_str(&resp, header::CONTENT_SECURITY_POLICY),
        "script-src 'self' 'unsafe-inline' 'unsafe-eval'"
    );
    assert!(resp.headers().get(header::CONTENT_RANGE).is_none());
    assert!(resp.headers().get(header::CONTENT_DISPOSITION).is_none());

    assert_eq!(body_bytes(resp).await, server.data);
}

#[tokio::test]
async fn open_ended_range_serves_tail() {
    let server = server(test_config());
    let resp = server
        .send(get_range(&server.file_uri(), "bytes=1000000-"))
        .await;

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&resp, header::CONTENT_RANGE),
        "bytes 1000000-1999999/2000000"
    );
    assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "1000000");
    assert_eq!(body_bytes(resp).await, &server.data[1_000_000..]);
}

#[tokio::test]
async fn bounded_and_suffix_ranges() {
    let server = server(test_config());

    let resp = server
        .send(get_range(&server.file_uri(), "bytes=524287-524388"))
        .await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&resp, header::CONTENT_RANGE),
        "bytes 524287-524388/2000000"
    );
    assert_eq!(body_bytes(resp).await, &server.data[524_287..524_389]);

    let resp = server.send(get_range(&server.file_uri(), "bytes=-10")).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        header_str(&resp, header::CONTENT_RANGE),
        "bytes 1999990-1999999/2000000"
    );
    assert_eq!(body_bytes(resp).await, &server.data[1_999_990..]);
}

#[tokio::test]
async fn range_past_end_is_unsatisfiable() {
    let server = server(test_config());
    let resp = server
        .send(get_range(&server.file_uri(), "bytes=2000000-"))
        .await;

    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header_str(&resp, header::CONTENT_RANGE), "bytes */2000000");
    assert_eq!(server.backend.fetches(), 0);
}

#[tokio::test]
async fn multi_range_is_ignored() {
    let server = server(test_config());
    let resp = server
        .send(get_range(&server.file_uri(), "bytes=0-1,5-9"))
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "2000000");
}

#[tokio::test]
async fn file_name_must_match_exactly() {
    let server = server(test_config());

    for name in ["Photo.jpg", "photo.jpeg", "other.bin"] {
        let resp = server
            .send(get(&format!("/{}/{}", server.token, name)))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", name);
    }
    assert_eq!(server.backend.fetches(), 0);
}

#[tokio::test]
async fn bad_token_is_not_found_with_envelope() {
    let server = server(test_config());
    let resp = server.send(get("/not-a-token/photo.jpg")).await;

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(resp).await,
        json!({ "code": 404, "message": "not found" })
    );
}

#[tokio::test]
async fn token_under_another_secret_is_not_found() {
    let server = server(test_config());
    let foreign = LocatorCodec::new("another secret")
        .unwrap()
        .encode(&IDENTITY)
        .unwrap();

    let resp = server.send(get(&format!("/{}/{}", foreign, FILE_NAME))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleted_message_is_not_found() {
    let server = server(test_config());
    let token = server
        .codec
        .encode(&ResourceIdentity::private(555, 43))
        .unwrap();

    let resp = server.send(get(&format!("/{}/{}", token, FILE_NAME))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn head_sends_headers_only() {
    let server = server(test_config());
    let req = request(Method::HEAD, &server.file_uri())
        .header(header::RANGE, "bytes=1000000-")
        .body(Body::empty())
        .unwrap();
    let resp = server.send(req).await;

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "1000000");
    assert_eq!(
        header_str(&resp, header::CONTENT_RANGE),
        "bytes 1000000-1999999/2000000"
    );
    assert!(body_bytes(resp).await.is_empty());

    assert_eq!(server.backend.fetches(), 0);
    assert_eq!(server.backend.connects(), 0);
    assert_eq!(server.state.admission().in_flight(CLIENT), 0);
}

#[tokio::test]
async fn head_is_not_subject_to_admission() {
    let mut config = test_config();
    config.server.request_limit = 1;
    let server = server(config);

    let held = server.send(get(&server.file_uri())).await;
    assert_eq!(held.status(), StatusCode::OK);

    let req = request(Method::HEAD, &server.file_uri())
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.send(req).await.status(), StatusCode::OK);
    assert_eq!(server.state.admission().in_flight(CLIENT), 1);
}

#[tokio::test]
async fn admission_limit_rejects_and_recovers() {
    let mut config = test_config();
    config.server.request_limit = 2;
    let server = server(config);

    let first = server.send(get(&server.file_uri())).await;
    let second = server.send(get(&server.file_uri())).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(server.state.admission().in_flight(CLIENT), 2);

    let rejected = server.send(get(&server.file_uri())).await;
    assert_eq!(rejected.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(server.state.admission().in_flight(CLIENT), 2);

    // Finishing a download frees its slot
    assert_eq!(body_bytes(first).await.len(), FILE_SIZE);
    assert_eq!(server.state.admission().in_flight(CLIENT), 1);

    let admitted = server.send(get(&server.file_uri())).await;
    assert_eq!(admitted.status(), StatusCode::OK);
    drop(second);
    drop(admitted);
    assert_eq!(server.state.admission().in_flight(CLIENT), 0);
}

#[tokio::test]
async fn client_abort_releases_everything() {
    let server = server(test_config());
    server.backend.set_fetch_delay(Duration::from_millis(10));

    let resp = server.send(get(&server.file_uri())).await;
    assert_eq!(server.state.admission().in_flight(CLIENT), 1);

    let mut body = resp.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(body);

    assert_eq!(server.state.admission().in_flight(CLIENT), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.leased_connections(), 0);
    assert_eq!(server.backend.active_fetches(), 0);
}

#[tokio::test]
async fn forwarded_client_ip_when_trusted() {
    let mut config = test_config();
    config.server.request_limit = 1;
    config.server.trust_forwarded_headers = true;
    let server = server(config);

    let from = |ip: &str| {
        request(Method::GET, &server.file_uri())
            .header("x-forwarded-for", format!("{}, 10.0.0.1", ip))
            .body(Body::empty())
            .unwrap()
    };

    let a = server.send(from("198.51.100.1")).await;
    let b = server.send(from("198.51.100.2")).await;
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let again = server.send(from("198.51.100.1")).await;
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(server.state.admission().in_flight(CLIENT), 0);
}

#[tokio::test]
async fn forwarded_header_ignored_when_untrusted() {
    let mut config = test_config();
    config.server.request_limit = 1;
    let server = server(config);

    let _held = server.send(get(&server.file_uri())).await;
    let req = request(Method::GET, &server.file_uri())
        .header("x-forwarded-for", "198.51.100.9")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.send(req).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn concurrent_overlapping_ranges() {
    let server = server(test_config());

    let a = server.send(get_range(&server.file_uri(), "bytes=100000-1500000"));
    let b = server.send(get_range(&server.file_uri(), "bytes=900000-1999999"));
    let (a, b) = tokio::join!(a, b);
    let (a, b) = tokio::join!(body_bytes(a), body_bytes(b));

    assert_eq!(a, &server.data[100_000..1_500_001]);
    assert_eq!(b, &server.data[900_000..]);
}

#[tokio::test]
async fn dl_flag_sets_attachment() {
    let server = server(test_config());
    let resp = server
        .send(get(&format!("{}?dl", server.file_uri())))
        .await;

    assert_eq!(
        header_str(&resp, header::CONTENT_DISPOSITION),
        "attachment; filename=\"photo.jpg\"; filename*=UTF-8''photo.jpg"
    );
}

#[tokio::test]
async fn non_ascii_names_are_encoded() {
    let server = server(test_config());
    let identity = ResourceIdentity::private(555, 77);
    server
        .backend
        .add_file(identity, "отчёт 1.pdf", "application/pdf", vec![1; 10], HOME_PARTITION);
    let token = server.codec.encode(&identity).unwrap();

    let uri = format!(
        "/{}/%D0%BE%D1%82%D1%87%D1%91%D1%82%201.pdf?dl=1",
        token
    );
    let resp = server.send(get(&uri)).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        header_str(&resp, header::CONTENT_DISPOSITION),
        "attachment; filename=\"_____ 1.pdf\"; \
         filename*=UTF-8''%D0%BE%D1%82%D1%87%D1%91%D1%82%201.pdf"
    );
}

#[tokio::test]
async fn oversized_file_is_not_served() {
    let mut config = test_config();
    config.server.max_file_size = Some(1_000_000);
    let server = server(config);

    let resp = server.send(get(&server.file_uri())).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(server.backend.fetches(), 0);
}

#[tokio::test]
async fn empty_file_is_served_without_stream() {
    let server = server(test_config());
    let identity = ResourceIdentity::private(555, 99);
    server
        .backend
        .add_file(identity, "empty.txt", "text/plain", Vec::new(), HOME_PARTITION);
    let token = server.codec.encode(&identity).unwrap();

    let resp = server
        .send(get_range(&format!("/{}/empty.txt", token), "bytes=0-"))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header_str(&resp, header::CONTENT_LENGTH), "0");
    assert!(body_bytes(resp).await.is_empty());
    assert_eq!(server.backend.connects(), 0);
}

#[tokio::test]
async fn upstream_failure_is_bad_gateway() {
    let server = server(test_config());
    server
        .backend
        .fail_next_resolves([UpstreamError::Fatal("CHANNEL_PRIVATE".into())]);

    let resp = server.send(get(&server.file_uri())).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        body_json(resp).await,
        json!({ "code": 502, "message": "bad gateway" })
    );
}

#[tokio::test]
async fn fetch_failure_before_first_byte_is_bad_gateway() {
    let server = server(test_config());
    let identity = ResourceIdentity::private(555, 79);
    server
        .backend
        .add_file(identity, "clip.mp4", "video/mp4", pattern(10_000), HOME_PARTITION);
    let token = server.codec.encode(&identity).unwrap();
    server
        .backend
        .fail_next_fetches([UpstreamError::Fatal("FILE_REFERENCE_EXPIRED".into())]);

    let resp = server.send(get(&format!("/{}/clip.mp4", token))).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert!(resp.headers().get(header::CONTENT_RANGE).is_none());
    assert_eq!(
        body_json(resp).await,
        json!({ "code": 502, "message": "bad gateway" })
    );

    assert_eq!(server.state.admission().in_flight(CLIENT), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.leased_connections(), 0);

    // The next request is served normally
    let resp = server.send(get(&format!("/{}/clip.mp4", token))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, pattern(10_000));
}

#[tokio::test]
async fn bare_token_is_not_found() {
    let server = server(test_config());
    let resp = server.send(get(&format!("/{}", server.token))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn index_page_follows_setting() {
    let server = server(test_config());
    assert_eq!(server.send(get("/")).await.status(), StatusCode::FORBIDDEN);

    let mut config = test_config();
    config.server.show_index = true;
    let server = self::server(config);
    let resp = server.send(get("/")).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let page = String::from_utf8(body_bytes(resp).await).unwrap();
    assert!(page.contains("https://t.me/file_stream_bot"));
    assert!(page.contains("File Stream"));
}

fn delete(uri: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = request(Method::DELETE, uri);
    if let Some(key) = key {
        builder = builder.header("x-web-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn delete_requires_secret() {
    let server = server(test_config());
    let uri = format!("/{}", server.token);

    assert_eq!(
        server.send(delete(&uri, None)).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        server.send(delete(&uri, Some("wrong"))).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        server.send(delete(&uri, Some("delete-secre"))).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert!(server.backend.contains(&IDENTITY));
}

#[tokio::test]
async fn delete_with_unknown_token_is_not_found() {
    let server = server(test_config());
    let resp = server.send(delete("/garbage", Some(DELETE_KEY))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_removes_message() {
    let server = server(test_config());
    let resp = server
        .send(delete(&format!("/{}", server.token), Some(DELETE_KEY)))
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        body_json(resp).await,
        json!({ "deleted": true, "token": server.token })
    );
    assert!(!server.backend.contains(&IDENTITY));

    let resp = server.send(get(&server.file_uri())).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_upstream_failure_is_bad_gateway() {
    let server = server(test_config());
    server
        .backend
        .fail_next_deletes([UpstreamError::Fatal("MESSAGE_DELETE_FORBIDDEN".into())]);

    let resp = server
        .send(delete(&format!("/{}", server.token), Some(DELETE_KEY)))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert!(server.backend.contains(&IDENTITY));
}

#[tokio::test]
async fn delete_disabled_without_key() {
    let mut config = test_config();
    config.security.delete_key = None;
    let server = server(config);

    let resp = server
        .send(delete(&format!("/{}", server.token), Some(DELETE_KEY)))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[test]
fn public_link_encodes_name() {
    assert_eq!(
        super::public_link("https://files.example.org/", "TOKEN", "my photo (1).jpg"),
        "https://files.example.org/TOKEN/my%20photo%20%281%29.jpg"
    );
}

#[tokio::test]
async fn public_link_round_trips_through_router() {
    let server = server(test_config());
    let identity = ResourceIdentity::private(555, 78);
    server
        .backend
        .add_file(identity, "a b+c.txt", "text/plain", b"hello".to_vec(), HOME_PARTITION);
    let token = server.codec.encode(&identity).unwrap();

    let link = super::public_link("", &token, "a b+c.txt");
    let resp = server.send(get(&link)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"hello");
}

#[tokio::test]
async fn serve_on_listener_until_shutdown() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let config = test_config();
    let backend = MemoryBackend::new();
    let data = pattern(50_000);
    backend.add_file(IDENTITY, FILE_NAME, "image/jpeg", data.clone(), HOME_PARTITION);
    let token = LocatorCodec::new(&config.security.token_secret)
        .unwrap()
        .encode(&IDENTITY)
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(super::serve_on(
        listener,
        config,
        backend.clone(),
        backend.clone(),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /{}/{} HTTP/1.1\r\nHost: localhost\r\nRange: bytes=10-\r\nConnection: close\r\n\r\n",
        token, FILE_NAME
    );
    conn.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    conn.read_to_end(&mut raw).await.unwrap();

    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
    let head = String::from_utf8_lossy(&raw[..split]).to_lowercase();
    assert!(head.starts_with("http/1.1 206"), "{}", head);
    assert!(head.contains("content-range: bytes 10-49999/50000"), "{}", head);
    assert_eq!(&raw[split + 4..], &data[10..]);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Teardown closed the idle connection
    assert_eq!(backend.closes(), backend.connects());
}
