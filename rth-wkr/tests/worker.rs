//! End-to-end tests of the remote test worker over real TCP.

use std::net::SocketAddr;
use std::process::Command;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::net::TcpStream;

use rth_common::protocol::{self, BuildLabel, DataFile, TestRequest, TestResponse};
use rth_common::types;
use rth_common::{BuildState, Configuration};
use rth_test::remote::{run_test_remotely, ClientPool};
use rth_wkr::worker::Server;

const MAX_MSG_SIZE: usize = 10 << 20;

const BINARY_FILE: &str = "#!/bin/sh\nmv data.txt $RESULTS_FILE\n";
const DATA_FILE: &str = "=== RUN   TestRunTest\n--- PASS: TestRunTest (0.00s)\nPASS\n";

async fn start_server(root: &TempDir) -> SocketAddr {
    let server = Server::bind(("127.0.0.1", 0), MAX_MSG_SIZE, root.path().to_path_buf())
        .await
        .expect("failed to bind test server");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

fn config_for(addr: SocketAddr) -> Configuration {
    let mut config = Configuration::default();
    config.test.remote_workers = vec![addr.to_string()];
    config
}

fn base_request(name: &str) -> TestRequest {
    TestRequest {
        rule: Some(BuildLabel {
            package_name: "tools/worker".to_string(),
            name: name.to_string(),
        }),
        command: "$TEST".to_string(),
        timeout: 50,
        path: vec![
            "/usr/local/bin".to_string(),
            "/usr/bin".to_string(),
            "/bin".to_string(),
        ],
        ..TestRequest::default()
    }
}

#[tokio::test]
async fn test_run_test() {
    let root = TempDir::new().unwrap();
    let addr = start_server(&root).await;
    let pool = ClientPool::new();
    let client = pool.get(&config_for(addr)).await.unwrap();

    let mut request = base_request("worker_test");
    request.coverage = true;
    request.binary = Some(DataFile {
        filename: "test.sh".to_string(),
        contents: BINARY_FILE.into(),
    });
    request.data = vec![DataFile {
        filename: "data.txt".to_string(),
        contents: DATA_FILE.into(),
    }];

    let response = client.test(&request).await.unwrap();
    assert!(response.success, "worker refused: {:?}", response.messages);
    assert!(response.exit_success);
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0], DATA_FILE.as_bytes());
    assert_eq!(response.rule.unwrap().name, "worker_test");

    // The scratch directory is gone again.
    let target = types::BuildTarget::new(types::BuildLabel::new("tools/worker", "worker_test"));
    assert!(!target.test_dir(root.path()).exists());
}

#[tokio::test]
async fn test_no_output_test_reports_ok() {
    let root = TempDir::new().unwrap();
    let addr = start_server(&root).await;
    let pool = ClientPool::new();
    let client = pool.get(&config_for(addr)).await.unwrap();

    let mut request = base_request("test_run_test_remotely");
    request.no_output = true;
    request.binary = Some(DataFile {
        filename: "test.sh".to_string(),
        contents: "#!/bin/sh\nprintf ok\n".into(),
    });

    let response = client.test(&request).await.unwrap();
    assert!(response.success, "worker refused: {:?}", response.messages);
    assert!(response.exit_success);
    assert_eq!(response.output, b"ok");
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn test_missing_data_is_structural_failure() {
    let root = TempDir::new().unwrap();
    let addr = start_server(&root).await;
    let pool = ClientPool::new();
    let client = pool.get(&config_for(addr)).await.unwrap();

    // Neither a binary nor data files: nothing to materialise.
    let request = base_request("test_data");
    let response = client.test(&request).await.unwrap();
    assert!(!response.success);
    assert!(
        response.messages[0].contains("data"),
        "unexpected message: {}",
        response.messages[0]
    );

    let target = types::BuildTarget::new(types::BuildLabel::new("tools/worker", "test_data"));
    assert!(!target.test_dir(root.path()).exists());
}

#[tokio::test]
async fn test_failing_test_still_returns_output() {
    let root = TempDir::new().unwrap();
    let addr = start_server(&root).await;
    let pool = ClientPool::new();
    let client = pool.get(&config_for(addr)).await.unwrap();

    let mut request = base_request("failing");
    request.no_output = true;
    request.binary = Some(DataFile {
        filename: "test.sh".to_string(),
        contents: "#!/bin/sh\necho boom >&2\nexit 4\n".into(),
    });

    let response = client.test(&request).await.unwrap();
    // Structurally fine; the test itself failed, diagnostics attached.
    assert!(response.success);
    assert!(!response.exit_success);
    assert!(String::from_utf8_lossy(&response.output).contains("boom"));
}

#[tokio::test]
async fn test_run_test_remotely_end_to_end() {
    let server_root = TempDir::new().unwrap();
    let addr = start_server(&server_root).await;

    // Build a client-side repo with the test binary on disk.
    let client_root = TempDir::new().unwrap();
    let mut target = types::BuildTarget::new(types::BuildLabel::new("pkg", "remote_case"));
    target.test_command = "$TEST".to_string();
    target.no_test_output = true;
    target.add_output("runner.sh");
    let out_dir = target.out_dir(client_root.path());
    std::fs::create_dir_all(&out_dir).unwrap();
    std::fs::write(out_dir.join("runner.sh"), "#!/bin/sh\nprintf ok\n").unwrap();

    let state = BuildState::new(config_for(addr));
    let results = run_test_remotely(&state, &target, client_root.path())
        .await
        .unwrap();
    assert_eq!(results.output, b"ok");
    assert!(results.results.is_empty());
    assert!(results.coverage.is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_are_serialised() {
    let root = TempDir::new().unwrap();
    let addr = start_server(&root).await;

    async fn one_rpc(addr: SocketAddr, name: &str) -> TestResponse {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = base_request(name);
        request.no_output = true;
        request.binary = Some(DataFile {
            filename: "test.sh".to_string(),
            contents: "#!/bin/sh\nsleep 0.4\n".into(),
        });
        protocol::write_frame(&mut stream, &request, MAX_MSG_SIZE)
            .await
            .unwrap();
        protocol::read_frame(&mut stream, MAX_MSG_SIZE)
            .await
            .unwrap()
            .expect("server closed connection without responding")
    }

    let started = Instant::now();
    let (first, second) = tokio::join!(one_rpc(addr, "first"), one_rpc(addr, "second"));
    assert!(first.success && first.exit_success);
    assert!(second.success && second.exit_success);
    // One test at a time: two 400ms sleeps cannot overlap.
    assert!(
        started.elapsed() >= Duration::from_millis(800),
        "requests overlapped: {:?}",
        started.elapsed()
    );
}

#[test]
fn test_version_flag() {
    let output = Command::new(env!("CARGO_BIN_EXE_rth-wkr"))
        .arg("--version")
        .output()
        .expect("failed to run rth-wkr --version");
    assert!(output.status.success());
    assert!(!String::from_utf8_lossy(&output.stdout).trim().is_empty());
}
