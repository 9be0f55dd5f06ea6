//! Protocol-level tests against a live server on a scratch socket. These
//! exercise the request plumbing and the fixed error strings without needing
//! any compiler toolchain.

mod common;

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use symdb::client::Client;
use symdb::config::Config;
use symdb::protocol::{ERR_INVALID_PROJ_NAME, ERR_PROJ_HOME_NOT_EXISTS, ERR_PROJECT_NOT_FOUND};
use symdb::server::Server;

fn start_server() -> (TempDir, PathBuf) {
    let data = TempDir::new().unwrap();
    let sock = data.path().join("symdb.sock");
    let config_path = common::write_config(data.path(), &sock, &[]);

    let config = Arc::new(Config::load(&config_path).unwrap());
    let listener = UnixListener::bind(&config.listen_path).unwrap();
    let mut server = Server::new(config).unwrap();
    thread::spawn(move || {
        let _ = server.run(listener);
    });

    (data, sock)
}

fn connect(sock: &PathBuf) -> Client {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match Client::connect(sock) {
            Ok(client) => return client,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("cannot connect to test server: {e}"),
        }
    }
}

#[test]
fn empty_server_lists_no_projects() {
    let (_data, sock) = start_server();
    let mut client = connect(&sock);

    let rsp = client.list_projects().unwrap();
    assert!(rsp.error.is_empty());
    assert!(rsp.projects.is_empty());
}

#[test]
fn invalid_project_name_is_rejected() {
    let (_data, sock) = start_server();
    let mut client = connect(&sock);

    let rsp = client.create_project("no-dashes-allowed", "/tmp").unwrap();
    assert_eq!(rsp.error, ERR_INVALID_PROJ_NAME);
}

#[test]
fn missing_home_is_rejected() {
    let (_data, sock) = start_server();
    let mut client = connect(&sock);

    let rsp = client
        .create_project("ghost", "/does/not/exist/anywhere")
        .unwrap();
    assert_eq!(rsp.error, ERR_PROJ_HOME_NOT_EXISTS);
}

#[test]
fn unknown_project_queries_fail_cleanly() {
    let (_data, sock) = start_server();
    let mut client = connect(&sock);

    let rsp = client.symbol_definition("nope", "c:@F@fn#", None).unwrap();
    assert_eq!(rsp.error, ERR_PROJECT_NOT_FOUND);

    let rsp = client.list_project_files("nope").unwrap();
    assert_eq!(rsp.error, ERR_PROJECT_NOT_FOUND);

    let rsp = client.rebuild_file("nope", "a.cpp").unwrap();
    assert_eq!(rsp.error, ERR_PROJECT_NOT_FOUND);
}

#[test]
fn sessions_survive_many_requests_on_one_connection() {
    let (_data, sock) = start_server();
    let mut client = connect(&sock);

    for _ in 0..50 {
        let rsp = client.list_projects().unwrap();
        assert!(rsp.error.is_empty());
    }
}
