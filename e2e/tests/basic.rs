//! Static serving, keep-alive and routing, end to end.

use std::fs;

use kiln_e2e::{client::Client, harness::TestServer, http_utils::http_request};

fn www_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("index.html"), "<h1>kiln</h1>").unwrap();
    fs::write(dir.path().join("page.txt"), "plain text page\n").unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub").join("a.txt"), "aaa").unwrap();
    fs::create_dir(dir.path().join("uploads")).unwrap();
    dir
}

fn config_for(root: &std::path::Path) -> String {
    let root = root.display();
    format!(
        r#"
        shutdown_grace = 0

        [[server]]
        listen = "127.0.0.1:0"

        [[server.route]]
        path = "/"
        root = "{root}"
        autoindex = true

        [[server.route]]
        path = "/files"
        root = "{root}/uploads"
        upload_dir = "{root}/uploads"

        [[server.route]]
        path = "/readonly"
        root = "{root}"
        methods = ["GET"]

        [[server.route]]
        path = "/old"
        redirect = {{ location = "/page.txt", code = 301 }}
        "#
    )
}

#[test]
fn serves_static_files_with_mime_types() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("static", server.address);
    client.connect();
    client.send(&http_request("GET", "/page.txt", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.body_string(), "plain text page\n");

    // the directory falls back to its index file
    client.send(&http_request("GET", "/", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert_eq!(response.body_string(), "<h1>kiln</h1>");
}

#[test]
fn missing_resource_is_404() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("missing", server.address);
    client.connect();
    client.send(&http_request("GET", "/nope.txt", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 404);
    // a 404 does not cost the connection
    client.send(&http_request("GET", "/page.txt", "localhost", ""));
    assert_eq!(client.receive().expect("no response").status, 200);
}

#[test]
fn pipelined_requests_get_ordered_responses() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("pipeline", server.address);
    client.connect();
    // two complete requests in a single write
    let double = format!(
        "{}{}",
        http_request("GET", "/page.txt", "localhost", ""),
        http_request("GET", "/sub/a.txt", "localhost", "")
    );
    client.send(&double);

    let first = client.receive().expect("first response lost");
    assert_eq!(first.status, 200);
    assert_eq!(first.body_string(), "plain text page\n");

    let second = client.receive().expect("second response lost");
    assert_eq!(second.status, 200);
    assert_eq!(second.body_string(), "aaa");
}

#[test]
fn connection_close_is_honored() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("close", server.address);
    client.connect();
    client.send(
        "GET /page.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(client.receive().is_none(), "connection should be closed");
}

#[test]
fn http10_requires_explicit_keep_alive() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("http10", server.address);
    client.connect();
    client.send("GET /page.txt HTTP/1.0\r\n\r\n");
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 200);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(client.receive().is_none());
}

#[test]
fn head_omits_the_body() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("head", server.address);
    client.connect();
    client.send("HEAD /page.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    let raw = client.receive_until_close();
    let raw = String::from_utf8(raw).expect("response is not utf-8");
    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("Content-Length: 16\r\n"));
    assert!(raw.ends_with("\r\n\r\n"), "a HEAD response carries no body");
}

#[test]
fn autoindex_lists_directories() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("autoindex", server.address);
    client.connect();
    client.send(&http_request("GET", "/sub/", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 200);
    let body = response.body_string();
    assert!(body.contains("a.txt"), "listing should mention a.txt: {body}");
}

#[test]
fn redirect_route() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("redirect", server.address);
    client.connect();
    client.send(&http_request("GET", "/old/anything", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 301);
    assert_eq!(response.header("location"), Some("/page.txt"));
}

#[test]
fn method_allow_list_yields_405() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("405", server.address);
    client.connect();
    client.send(&http_request("POST", "/readonly/page.txt", "localhost", "body"));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 405);
    assert_eq!(response.header("allow"), Some("GET"));
}

#[test]
fn upload_then_fetch_then_delete() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("upload", server.address);
    client.connect();

    client.send(&http_request("POST", "/files/report.txt", "localhost", "uploaded data"));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 201);
    assert_eq!(response.header("location"), Some("/files/report.txt"));
    assert!(www.path().join("uploads").join("report.txt").exists());

    client.send(&http_request("GET", "/files/report.txt", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 200);
    assert_eq!(response.body_string(), "uploaded data");

    client.send(&http_request("DELETE", "/files/report.txt", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 204);
    assert!(!www.path().join("uploads").join("report.txt").exists());

    client.send(&http_request("DELETE", "/files/report.txt", "localhost", ""));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 404);
}

#[test]
fn chunked_request_bodies_are_decoded() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("chunked", server.address);
    client.connect();
    client.send(
        "POST /files/chunked.txt HTTP/1.1\r\nHost: localhost\r\n\
         Transfer-Encoding: chunked\r\n\r\n\
         7\r\nchunked\r\n7\r\n upload\r\n0\r\n\r\n",
    );
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 201);
    assert_eq!(
        fs::read_to_string(www.path().join("uploads").join("chunked.txt")).unwrap(),
        "chunked upload"
    );
}

#[test]
fn malformed_request_is_400_and_closed() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("bad", server.address);
    client.connect();
    client.send("GET /page.txt\r\nHost: localhost\r\n\r\n");
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 400);
    assert!(client.receive().is_none(), "protocol errors close the connection");
}

#[test]
fn unsupported_method_is_501() {
    let www = www_fixture();
    let server = TestServer::start(&config_for(www.path()));

    let mut client = Client::new("brew", server.address);
    client.connect();
    client.send("BREW /pot HTTP/1.1\r\nHost: localhost\r\n\r\n");
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 501);
}
