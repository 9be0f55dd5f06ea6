//! End-to-end indexing scenarios over the live daemon. These need `cmake`
//! and a working libclang on the host, so they are ignored by default:
//!
//! ```text
//! cargo test -- --ignored
//! ```

mod common;

use std::fs;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use common::TestRepo;
use symdb::client::Client;
use symdb::config::Config;
use symdb::protocol::ERR_SYMBOL_NOT_FOUND;
use symdb::server::Server;

const FN_USR: &str = "c:@F@fn#";
const GN_USR: &str = "c:@F@gn#";

fn start_server_with(repo: &TestRepo) -> (TempDir, PathBuf) {
    let data = TempDir::new().unwrap();
    let sock = data.path().join("symdb.sock");
    let config_path = common::write_config(data.path(), &sock, &[("demo", repo.path())]);

    let config = Arc::new(Config::load(&config_path).unwrap());
    let listener = UnixListener::bind(&config.listen_path).unwrap();
    let mut server = Server::new(config).unwrap();
    thread::spawn(move || {
        let _ = server.run(listener);
    });

    (data, sock)
}

fn connect(sock: &PathBuf) -> Client {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match Client::connect(sock) {
            Ok(client) => return client,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("cannot connect: {e}"),
        }
    }
}

/// Polls until the predicate holds or the timeout passes.
fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut ready: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(250));
    }
    false
}

#[test]
#[ignore = "requires cmake and a libclang toolchain"]
fn fresh_index_edit_and_delete() {
    let repo = TestRepo::new();
    repo.add_file("a.cpp", "void fn() {}\n");
    repo.cmake_project("demo", &["a.cpp"]);

    let (_data, sock) = start_server_with(&repo);
    let mut client = connect(&sock);

    // S1: the initial build makes the definition queryable.
    assert!(
        wait_for(Duration::from_secs(60), || {
            let rsp = client.symbol_definition("demo", FN_USR, None).unwrap();
            rsp.error.is_empty() && !rsp.locations.is_empty()
        }),
        "initial index never produced {FN_USR}"
    );
    let rsp = client.symbol_definition("demo", FN_USR, None).unwrap();
    assert!(rsp.locations[0].path.ends_with("a.cpp"));
    assert_eq!(rsp.locations[0].line, 1);
    assert_eq!(rsp.locations[0].column, 6);

    let files = client.list_project_files("demo").unwrap();
    assert_eq!(files.files, vec!["a.cpp".to_string()]);

    // S2: rename fn -> gn; the watcher queues it and a smart-sync tick
    // commits the replacement.
    repo.add_file("a.cpp", "void gn() {}\n");
    assert!(
        wait_for(Duration::from_secs(60), || {
            let rsp = client.symbol_definition("demo", GN_USR, None).unwrap();
            rsp.error.is_empty() && !rsp.locations.is_empty()
        }),
        "edited symbol never appeared"
    );
    let rsp = client.symbol_definition("demo", FN_USR, None).unwrap();
    assert_eq!(rsp.error, ERR_SYMBOL_NOT_FOUND);

    // S3: deleting the file drops every row.
    fs::remove_file(repo.path().join("a.cpp")).unwrap();
    assert!(
        wait_for(Duration::from_secs(30), || {
            let rsp = client.symbol_definition("demo", GN_USR, None).unwrap();
            rsp.error == ERR_SYMBOL_NOT_FOUND
        }),
        "deleted symbol is still queryable"
    );
    let files = client.list_project_files("demo").unwrap();
    assert!(files.files.is_empty());
}

#[test]
#[ignore = "requires cmake and a libclang toolchain"]
fn rebuild_file_round_trips() {
    let repo = TestRepo::new();
    repo.add_file("a.cpp", "void fn() {}\n");
    repo.cmake_project("demo", &["a.cpp"]);

    let (_data, sock) = start_server_with(&repo);
    let mut client = connect(&sock);

    assert!(wait_for(Duration::from_secs(60), || {
        let rsp = client.symbol_definition("demo", FN_USR, None).unwrap();
        rsp.error.is_empty()
    }));

    let rsp = client.rebuild_file("demo", "a.cpp").unwrap();
    assert!(rsp.error.is_empty());

    assert!(
        wait_for(Duration::from_secs(30), || {
            let rsp = client.symbol_definition("demo", FN_USR, None).unwrap();
            rsp.error.is_empty() && !rsp.locations.is_empty()
        }),
        "rebuild lost the definition"
    );

    let symbols = client.file_symbols("demo", "a.cpp").unwrap();
    assert!(symbols.symbols.iter().any(|s| s.name == FN_USR));
}
