//! Resource limits and timeouts: body ceiling, idle connections, the
//! connection cap.

use std::{fs, thread, time::Duration};

use kiln_e2e::{client::Client, harness::TestServer, http_utils::http_request};

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("page.txt"), "ok\n").unwrap();
    fs::create_dir(dir.path().join("uploads")).unwrap();
    dir
}

fn config_for(root: &std::path::Path, max_connections: usize) -> String {
    let root = root.display();
    format!(
        r#"
        max_connections = {max_connections}
        client_body_limit = 64
        idle_timeout = 1
        shutdown_grace = 0

        [[server]]
        listen = "127.0.0.1:0"

        [[server.route]]
        path = "/"
        root = "{root}"

        [[server.route]]
        path = "/drop"
        root = "{root}/uploads"
        upload_dir = "{root}/uploads"
        "#
    )
}

#[test]
fn body_at_the_limit_is_accepted() {
    let www = fixture();
    let server = TestServer::start(&config_for(www.path(), 16));

    let mut client = Client::new("limit", server.address);
    client.connect();
    let body = "a".repeat(64);
    client.send(&http_request("POST", "/drop/exact.txt", "localhost", body));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 201);
}

#[test]
fn body_over_the_limit_is_413() {
    let www = fixture();
    let server = TestServer::start(&config_for(www.path(), 16));

    let mut client = Client::new("overflow", server.address);
    client.connect();
    let body = "a".repeat(65);
    client.send(&http_request("POST", "/drop/over.txt", "localhost", body));
    let response = client.receive().expect("no response");
    assert_eq!(response.status, 413);
    assert!(client.receive().is_none(), "413 closes the connection");
    assert!(!www.path().join("uploads").join("over.txt").exists());
}

#[test]
fn stalled_request_gets_408() {
    let www = fixture();
    let server = TestServer::start(&config_for(www.path(), 16));

    let mut client = Client::new("stalled", server.address);
    client.connect();
    // start a request and never finish it
    client.send("GET /page.txt HT");
    let response = client.receive().expect("expected a 408 before the close");
    assert_eq!(response.status, 408);
    assert!(client.receive().is_none());
}

#[test]
fn silent_connection_gets_408() {
    let www = fixture();
    let server = TestServer::start(&config_for(www.path(), 16));

    let mut client = Client::new("silent", server.address);
    client.connect();
    // no byte of a first request ever arrives
    let response = client.receive().expect("expected a 408 before the close");
    assert_eq!(response.status, 408);
}

#[test]
fn idle_keep_alive_connection_is_closed_silently() {
    let www = fixture();
    let server = TestServer::start(&config_for(www.path(), 16));

    let mut client = Client::new("idle", server.address);
    client.connect();
    client.send(&http_request("GET", "/page.txt", "localhost", ""));
    assert_eq!(client.receive().expect("no response").status, 200);

    // between requests the connection times out without a response
    client.expect_silent_close();
}

#[test]
fn connection_cap_pauses_accepting_until_a_slot_frees() {
    let www = fixture();
    let server = TestServer::start(&config_for(www.path(), 2));

    let mut first = Client::new("first", server.address);
    let mut second = Client::new("second", server.address);
    first.connect();
    second.connect();
    first.send(&http_request("GET", "/page.txt", "localhost", ""));
    second.send(&http_request("GET", "/page.txt", "localhost", ""));
    assert_eq!(first.receive().expect("no response").status, 200);
    assert_eq!(second.receive().expect("no response").status, 200);

    // the cap is reached: a third connection sits in the accept queue
    let mut third = Client::new("third", server.address);
    third.connect();
    third.send(&http_request("GET", "/page.txt", "localhost", ""));
    assert!(
        third.try_receive_within(Duration::from_millis(300)).is_none(),
        "the third connection should not be served at the cap"
    );

    // freeing a slot resumes accepting and the queued connection is served
    first.close();
    thread::sleep(Duration::from_millis(100));
    let response = third.receive().expect("queued connection never served");
    assert_eq!(response.status, 200);
}
