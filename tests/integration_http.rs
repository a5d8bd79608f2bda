mod common;

use std::time::Duration;

use common::{MockResponse, MockServer, gzip_bytes};
use reqflow::prelude::{CallContext, ClientSettings, Error, ErrorCode, HttpClient};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, PartialEq, Serialize)]
struct Person {
    name: String,
    age: u32,
}

fn local_settings() -> ClientSettings {
    let settings = ClientSettings::new();
    settings
        .clear_proxy()
        .set_timeout(Duration::from_secs(2));
    settings
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_sends_query_pairs_in_order() {
    let server = MockServer::start(vec![MockResponse::new(200, "ok")]);
    let settings = local_settings();

    let response = settings
        .get(server.url("/y"))
        .query("a", "1")
        .query("b", "2")
        .query("c", "3")
        .send(&CallContext::background())
        .await
        .expect("request should succeed");

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().expect("utf-8 body"), "ok");
    assert_eq!(response.attempts(), 1);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/y?a=1&b=2&c=3");
    assert!(
        requests[0]
            .headers
            .get("user-agent")
            .is_some_and(|agent| agent.starts_with("reqflow/"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_body_round_trips_through_server() {
    let server = MockServer::start(vec![
        MockResponse::new(200, r#"{"name":"Alice","age":25}"#)
            .header("Content-Type", "application/json"),
    ]);
    let settings = local_settings();
    let alice = Person {
        name: "Alice".to_owned(),
        age: 25,
    };

    let echoed: Person = settings
        .post(server.url("/people"))
        .json(&alice)
        .send_json(&CallContext::background())
        .await
        .expect("json call should succeed");

    assert_eq!(echoed, alice);
    let requests = server.requests();
    assert_eq!(
        requests[0].headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    let observed: Person =
        serde_json::from_slice(&requests[0].body).expect("server body should be json");
    assert_eq!(observed, alice);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_without_body_sends_query_as_form() {
    let server = MockServer::start(vec![MockResponse::new(204, "")]);
    let settings = local_settings();

    let status = settings
        .post(server.url("/login"))
        .query("user", "alice")
        .send_ignore(&CallContext::background())
        .await
        .expect("form post should succeed");

    assert_eq!(status.as_u16(), 204);
    let requests = server.requests();
    assert_eq!(requests[0].path, "/login");
    assert_eq!(requests[0].body, b"user=alice");
    assert_eq!(
        requests[0].headers.get("content-type").map(String::as_str),
        Some("application/x-www-form-urlencoded")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_redirects_return_the_redirect_response() {
    let server = MockServer::start(vec![
        MockResponse::new(302, "").header("Location", "/elsewhere"),
    ]);
    let settings = local_settings();
    settings.set_follow_redirects(false);

    let response = settings
        .get(server.url("/start"))
        .send(&CallContext::background())
        .await
        .expect("redirect response should be returned");

    assert_eq!(response.status().as_u16(), 302);
    assert_eq!(
        response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok()),
        Some("/elsewhere")
    );
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn see_other_redirect_switches_to_get_and_drops_body() {
    let server = MockServer::start(vec![
        MockResponse::new(303, "").header("Location", "/done"),
        MockResponse::new(200, "landed"),
    ]);
    let settings = local_settings();

    let response = settings
        .post(server.url("/submit"))
        .body("payload")
        .send(&CallContext::background())
        .await
        .expect("redirect chain should succeed");

    assert_eq!(response.text().expect("utf-8 body"), "landed");
    assert!(response.url().ends_with("/done"));
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].path, "/done");
    assert!(requests[1].body.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gzip_response_is_decoded_transparently() {
    let server = MockServer::start(vec![
        MockResponse::new(200, gzip_bytes(b"hello gzip")).header("Content-Encoding", "gzip"),
    ]);
    let settings = local_settings();

    let response = settings
        .get(server.url("/compressed"))
        .send(&CallContext::background())
        .await
        .expect("compressed response should succeed");

    assert_eq!(response.text().expect("utf-8 body"), "hello gzip");
    assert!(!response.headers().contains_key("content-encoding"));
    assert!(
        server.requests()[0]
            .headers
            .get("accept-encoding")
            .is_some_and(|value| value.contains("gzip"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_decompress_can_be_disabled_per_request() {
    let compressed = gzip_bytes(b"raw");
    let server = MockServer::start(vec![
        MockResponse::new(200, compressed.clone()).header("Content-Encoding", "gzip"),
    ]);
    let settings = local_settings();

    let response = settings
        .get(server.url("/compressed"))
        .auto_decompress(false)
        .send(&CallContext::background())
        .await
        .expect("compressed response should succeed");

    assert_eq!(response.bytes().as_ref(), compressed.as_slice());
    assert!(response.headers().contains_key("content-encoding"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_multipart_file_is_reported_as_multipart_error() {
    let server = MockServer::start(vec![MockResponse::new(200, "unused")]);
    let settings = local_settings();

    let error = settings
        .get(server.url("/upload"))
        .file("doc", "/definitely/missing/reqflow-upload.bin")
        .field("note", "hi")
        .send(&CallContext::background())
        .await
        .expect_err("missing file should fail the upload");

    assert_eq!(error.code(), ErrorCode::Multipart);
    match error {
        Error::Multipart { field, source, .. } => {
            assert_eq!(field, "doc");
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multipart_upload_streams_files_then_fields() {
    let path = std::env::temp_dir().join(format!("reqflow-upload-{}.txt", std::process::id()));
    std::fs::write(&path, b"file-bytes").expect("write upload fixture");
    let server = MockServer::start(vec![MockResponse::new(201, "stored")]);
    let settings = local_settings();

    let response = settings
        .get(server.url("/upload"))
        .file("doc", &path)
        .field("note", "hi")
        .query("album", "trip")
        .send(&CallContext::background())
        .await
        .expect("upload should succeed");

    assert_eq!(response.status().as_u16(), 201);
    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert!(
        requests[0]
            .headers
            .get("content-type")
            .is_some_and(|value| value.starts_with("multipart/form-data; boundary="))
    );
    let body = String::from_utf8_lossy(&requests[0].body);
    let file_at = body.find("file-bytes").expect("file content in body");
    let note_at = body.find("name=\"note\"").expect("note field in body");
    let album_at = body.find("name=\"album\"").expect("query pair as field");
    assert!(file_at < note_at && note_at < album_at);
    let _ = std::fs::remove_file(path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trace_id_from_context_is_forwarded() {
    let server = MockServer::start(vec![MockResponse::new(200, "ok"), MockResponse::new(200, "ok")]);
    let settings = local_settings();
    let ctx = CallContext::background().with_trace_id("trace-42");

    settings
        .get(server.url("/traced"))
        .send_ignore(&ctx)
        .await
        .expect("traced call should succeed");
    settings
        .get(server.url("/explicit"))
        .header("X-Trace-ID", "caller-set")
        .send_ignore(&ctx)
        .await
        .expect("traced call should succeed");

    let requests = server.requests();
    assert_eq!(
        requests[0].headers.get("x-trace-id").map(String::as_str),
        Some("trace-42")
    );
    assert_eq!(
        requests[1].headers.get("x-trace-id").map(String::as_str),
        Some("caller-set")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cookie_jar_replays_server_cookies() {
    let server = MockServer::start(vec![
        MockResponse::new(200, "login").header("Set-Cookie", "session=abc; Path=/"),
        MockResponse::new(200, "profile"),
    ]);
    let settings = local_settings();
    settings.set_enable_cookie(true);
    let ctx = CallContext::background();

    settings
        .post(server.url("/login"))
        .send_ignore(&ctx)
        .await
        .expect("login should succeed");
    settings
        .get(server.url("/profile"))
        .cookie("theme", "dark")
        .send_ignore(&ctx)
        .await
        .expect("profile should succeed");

    let requests = server.requests();
    assert!(!requests[0].headers.contains_key("cookie"));
    let cookie = requests[1]
        .headers
        .get("cookie")
        .expect("second request should carry cookies");
    assert!(cookie.contains("theme=dark"));
    assert!(cookie.contains("session=abc"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hostile_set_cookie_attributes_are_contained() {
    let server = MockServer::start(vec![
        MockResponse::new(200, "login")
            .header("Set-Cookie", "forever=1; Max-Age=9223372036854775807; Path=/")
            .header("Set-Cookie", "wide=1; Domain=1; Path=/"),
        MockResponse::new(200, "profile"),
    ]);
    let settings = local_settings();
    settings.set_enable_cookie(true);
    let ctx = CallContext::background();

    let first = tokio::spawn({
        let settings = settings.clone();
        let url = server.url("/login");
        async move { settings.get(url).send_ignore(&CallContext::background()).await }
    })
    .await
    .expect("storing cookies must not panic");
    first.expect("login should succeed");

    settings
        .get(server.url("/profile"))
        .send_ignore(&ctx)
        .await
        .expect("profile should succeed");

    let cookie = server.requests()[1]
        .headers
        .get("cookie")
        .cloned()
        .expect("long-lived cookie should be sent");
    assert_eq!(cookie, "forever=1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_reports_timings_and_debug_dump() {
    let server = MockServer::start(vec![MockResponse::new(200, "ok")]);
    let settings = local_settings();
    settings.set_debug(true);

    let response = settings
        .put(server.url("/items/1"))
        .body("payload")
        .send(&CallContext::background())
        .await
        .expect("request should succeed");

    let timings = response.timings().to_string();
    assert!(timings.starts_with("total="), "{timings}");
    assert!(timings.contains("/dns=0/"), "{timings}");
    assert!(timings.contains("/reused=false/"), "{timings}");
    assert!(response.timings().wait.is_some());

    let dump = response.dump().expect("debug mode records a dump");
    assert!(dump.starts_with("PUT /items/1 HTTP/1.1\r\n"), "{dump}");
    assert!(dump.ends_with("\r\n\r\npayload"), "{dump}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_client_helpers_apply_default_headers() {
    let server = MockServer::start(vec![
        MockResponse::new(200, r#"{"name":"Bob","age":7}"#),
        MockResponse::new(200, r#"{"name":"Bob","age":8}"#),
    ]);
    let mut client = HttpClient::new(local_settings());
    client
        .set_default_header("x-tenant", "acme")
        .expect("valid default header");
    let ctx = CallContext::background();

    let fetched: Person = client
        .get_json(&ctx, server.url("/people/bob"))
        .await
        .expect("get_json should succeed");
    let updated: Person = client
        .put_json(
            &ctx,
            server.url("/people/bob"),
            &Person {
                name: "Bob".to_owned(),
                age: 8,
            },
        )
        .await
        .expect("put_json should succeed");

    assert_eq!(fetched.age, 7);
    assert_eq!(updated.age, 8);
    let requests = server.requests();
    assert_eq!(requests[1].method, "PUT");
    assert!(
        requests
            .iter()
            .all(|request| request.headers.get("x-tenant").map(String::as_str) == Some("acme"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_decode_failure_keeps_body() {
    let server = MockServer::start(vec![MockResponse::new(200, "<html>oops</html>")]);
    let settings = local_settings();

    let error = settings
        .get(server.url("/not-json"))
        .send_json::<Person>(&CallContext::background())
        .await
        .expect_err("html is not json");

    match error {
        Error::Decode { body, .. } => assert_eq!(body, "<html>oops</html>"),
        other => panic!("unexpected error: {other}"),
    }
}
