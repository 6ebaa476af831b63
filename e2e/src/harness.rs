//! Runs a kiln server on a background thread for the duration of a test.

use std::{
    net::SocketAddr,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc},
    thread::JoinHandle,
};

use kiln_lib::{config::Config, server::Server};

pub struct TestServer {
    pub address: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Bind and start a server from a TOML snippet; listeners should use
    /// port 0 so tests never collide.
    pub fn start(config: &str) -> TestServer {
        let config = Config::parse(config).expect("invalid test configuration");
        let mut server = Server::new(config).expect("could not start the test server");
        let address = *server
            .listen_addrs()
            .first()
            .expect("the test server has no listener");
        let stop = server.stop_handle();
        let handle = std::thread::spawn(move || {
            if let Err(error) = server.run() {
                panic!("test server failed: {error}");
            }
        });
        TestServer {
            address,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
