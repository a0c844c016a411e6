//! Remote test execution against a fleet of test workers.
//!
//! The build host ships the test binary and its runtime data files to a
//! worker chosen at random from the configured addresses, then maps the
//! response back into the local result shapes. Compiled out behind the
//! `remote` feature during bootstrap builds.

use thiserror::Error;

/// What a remote test run handed back, whether or not the test passed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteTestResults {
    pub output: Vec<u8>,
    pub results: Vec<Vec<u8>>,
    pub coverage: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum RemoteTestError {
    #[error("no remote test workers are configured")]
    NoWorkers,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[cfg(feature = "remote")]
    #[error(transparent)]
    Protocol(#[from] rth_common::protocol::ProtocolError),
    #[error("test RPC timed out")]
    RpcTimeout,
    #[error("worker closed the connection without responding")]
    ConnectionClosed,
    /// The worker could not run the test at all (structural failure).
    #[error("Failed to run test: {0}")]
    Worker(String),
    /// The test ran but failed; output and results are still attached.
    #[error("remote test failed")]
    TestFailed(RemoteTestResults),
    #[error("Cannot run test remotely, remote running is not compiled")]
    NotCompiled,
}

/// Stub used during bootstrap when the wire protocol isn't compiled in.
#[cfg(not(feature = "remote"))]
pub async fn run_test_remotely(
    _state: &rth_common::types::BuildState,
    _target: &rth_common::types::BuildTarget,
    _repo_root: &std::path::Path,
) -> Result<RemoteTestResults, RemoteTestError> {
    Err(RemoteTestError::NotCompiled)
}

#[cfg(feature = "remote")]
pub use enabled::{client_pool, run_test_remotely, ClientPool, WorkerClient};

#[cfg(feature = "remote")]
mod enabled {
    use super::{RemoteTestError, RemoteTestResults};

    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, OnceLock, RwLock};
    use std::time::Duration;

    use rand::seq::SliceRandom;
    use tokio::net::TcpStream;
    use tokio::sync::Mutex;
    use tracing::debug;
    use walkdir::WalkDir;

    use rth_common::config::Configuration;
    use rth_common::protocol::{self, DataFile, TestRequest, TestResponse};
    use rth_common::types::{BuildState, BuildTarget};

    /// Frame bound for client-side reads and writes; matches the worker's
    /// default `--max_msg_size`.
    const MAX_MESSAGE_SIZE: usize = 500 << 20;

    const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

    /// One connection to one test worker. RPCs on a single connection are
    /// serialised, which costs nothing given workers run one test at a time.
    pub struct WorkerClient {
        address: String,
        stream: Mutex<TcpStream>,
    }

    impl WorkerClient {
        async fn connect(address: &str) -> io::Result<Self> {
            let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("timed out dialing test worker {address}"),
                    )
                })??;
            Ok(Self {
                address: address.to_string(),
                stream: Mutex::new(stream),
            })
        }

        pub fn address(&self) -> &str {
            &self.address
        }

        /// Performs one `Test` RPC.
        pub async fn test(&self, request: &TestRequest) -> Result<TestResponse, RemoteTestError> {
            let mut stream = self.stream.lock().await;
            protocol::write_frame(&mut *stream, request, MAX_MESSAGE_SIZE).await?;
            match protocol::read_frame(&mut *stream, MAX_MESSAGE_SIZE).await? {
                Some(response) => Ok(response),
                None => Err(RemoteTestError::ConnectionClosed),
            }
        }
    }

    /// Lazily-dialed worker clients, keyed by address.
    #[derive(Default)]
    pub struct ClientPool {
        clients: RwLock<HashMap<String, Arc<WorkerClient>>>,
    }

    impl ClientPool {
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns a client for one of the configured workers, dialing on
        /// first use of an address.
        // TODO: support TLS connections here.
        pub async fn get(
            &self,
            config: &Configuration,
        ) -> Result<Arc<WorkerClient>, RemoteTestError> {
            let address = config
                .test
                .remote_workers
                .choose(&mut rand::thread_rng())
                .ok_or(RemoteTestError::NoWorkers)?
                .clone();
            {
                let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
                if let Some(client) = clients.get(&address) {
                    return Ok(client.clone());
                }
            }
            // Two first users of an address can race to here; the extra
            // connection is harmless and the later insert simply wins.
            debug!("Dialing test worker at {address}");
            let client = Arc::new(WorkerClient::connect(&address).await?);
            self.clients
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(address, client.clone());
            Ok(client)
        }
    }

    static POOL: OnceLock<ClientPool> = OnceLock::new();

    /// The process-wide client pool, living for the length of the build.
    pub fn client_pool() -> &'static ClientPool {
        POOL.get_or_init(ClientPool::new)
    }

    /// Runs a single test on a remote worker, returning its output, raw
    /// results documents and coverage.
    pub async fn run_test_remotely(
        state: &BuildState,
        target: &BuildTarget,
        repo_root: &Path,
    ) -> Result<RemoteTestResults, RemoteTestError> {
        let client = client_pool().get(&state.config).await?;
        let timeout = target
            .test_timeout
            .unwrap_or_else(|| state.config.default_test_timeout());
        let request = build_request(state, target, repo_root, timeout)?;
        debug!(
            "Running test {} remotely on {}",
            target.label,
            client.address()
        );
        let response = tokio::time::timeout(timeout, client.test(&request))
            .await
            .map_err(|_| RemoteTestError::RpcTimeout)??;
        // A structural failure comes back in the response body; an error on
        // the RPC itself was already returned above.
        if !response.success {
            return Err(RemoteTestError::Worker(response.messages.join("\n")));
        }
        let payload = RemoteTestResults {
            output: response.output,
            results: response.results,
            coverage: response.coverage,
        };
        if !response.exit_success {
            return Err(RemoteTestError::TestFailed(payload));
        }
        Ok(payload)
    }

    /// Builds the wire request for one target, reading its binary and data
    /// files off disk.
    fn build_request(
        state: &BuildState,
        target: &BuildTarget,
        repo_root: &Path,
        timeout: Duration,
    ) -> Result<TestRequest, RemoteTestError> {
        let mut request = TestRequest {
            rule: Some(protocol::BuildLabel {
                package_name: target.label.package_name.clone(),
                name: target.label.name.clone(),
            }),
            command: target.test_command.clone(),
            coverage: state.need_coverage,
            test_name: state.test_args.clone(),
            timeout: timeout.as_secs() as i32,
            labels: target.labels.clone(),
            no_output: target.no_test_output,
            path: state.config.build.path.clone(),
            ..TestRequest::default()
        };
        let out_dir = target.out_dir(repo_root);
        // Attach the test binary when the target declares exactly one output.
        if let [output] = target.outputs() {
            let contents = std::fs::read(out_dir.join(output))?;
            request.binary = Some(DataFile {
                filename: output.clone(),
                contents,
            });
        }
        // Attach its runtime files; data deps can be directories.
        for datum in &target.data {
            for entry in WalkDir::new(datum).sort_by_file_name() {
                let entry = entry.map_err(io::Error::from)?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let contents = std::fs::read(entry.path())?;
                let path = entry.path().to_string_lossy();
                let out_prefix = out_dir.to_string_lossy();
                let filename = path
                    .strip_prefix(out_prefix.as_ref())
                    .unwrap_or(&path)
                    .trim_start_matches('/')
                    .to_string();
                request.data.push(DataFile { filename, contents });
            }
        }
        Ok(request)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        use std::fs;

        use tempfile::TempDir;

        use rth_common::types::BuildLabel;

        #[tokio::test]
        async fn test_no_workers_configured() {
            let state = BuildState::default();
            let target = BuildTarget::new(BuildLabel::new("pkg", "t"));
            let err = run_test_remotely(&state, &target, Path::new("."))
                .await
                .unwrap_err();
            assert!(matches!(err, RemoteTestError::NoWorkers));
        }

        #[test]
        fn test_build_request_attaches_binary_and_data() {
            let root = TempDir::new().unwrap();
            let mut target = BuildTarget::new(BuildLabel::new("pkg", "t"));
            target.test_command = "$TEST".to_string();
            target.add_output("runner.sh");

            let out_dir = target.out_dir(root.path());
            fs::create_dir_all(out_dir.join("data")).unwrap();
            fs::write(out_dir.join("runner.sh"), b"#!/bin/sh\n").unwrap();
            fs::write(out_dir.join("data/a.txt"), b"aaa").unwrap();
            fs::write(out_dir.join("data/b.txt"), b"bbb").unwrap();
            target.data.push(out_dir.join("data"));

            let state = BuildState::default();
            let request =
                build_request(&state, &target, root.path(), Duration::from_secs(50)).unwrap();
            assert_eq!(request.timeout, 50);
            let binary = request.binary.unwrap();
            assert_eq!(binary.filename, "runner.sh");
            assert_eq!(binary.contents, b"#!/bin/sh\n");
            // Data filenames are relative to the out dir, no leading slash.
            let names: Vec<&str> = request.data.iter().map(|d| d.filename.as_str()).collect();
            assert_eq!(names, ["data/a.txt", "data/b.txt"]);
        }

        #[test]
        fn test_build_request_skips_binary_with_multiple_outputs() {
            let root = TempDir::new().unwrap();
            let mut target = BuildTarget::new(BuildLabel::new("pkg", "multi"));
            target.add_output("one");
            target.add_output("two");
            let request = build_request(
                &BuildState::default(),
                &target,
                root.path(),
                Duration::from_secs(1),
            )
            .unwrap();
            assert!(request.binary.is_none());
        }
    }
}
