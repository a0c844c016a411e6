//! The remote test worker server.
//!
//! Accepts connections in parallel but runs at most one test at a time; a
//! second `Test` RPC queues on the worker mutex until the first completes.
//! Each request materialises its files into the target's scratch directory,
//! which is removed again on every exit path.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use rth_common::protocol::{self, DataFile, ProtocolError, TestRequest, TestResponse};
use rth_common::types::{BuildLabel, BuildState, BuildTarget};
use rth_common::Configuration;
use rth_test::runner;

/// A bound test worker server.
pub struct Server {
    listener: TcpListener,
    worker: Arc<Worker>,
    max_msg_size: usize,
}

impl Server {
    /// Binds the listening socket. The repo root anchors every target's
    /// scratch directory.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        max_msg_size: usize,
        repo_root: PathBuf,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            worker: Arc::new(Worker::new(repo_root)),
            max_msg_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections until the process is killed.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {addr}");
                    let worker = self.worker.clone();
                    let max_msg_size = self.max_msg_size;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, worker, max_msg_size).await {
                            warn!("Connection error: {e}");
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {e}"),
            }
        }
    }
}

/// Reads request frames off one connection until the peer hangs up.
async fn handle_connection(
    mut stream: TcpStream,
    worker: Arc<Worker>,
    max_msg_size: usize,
) -> Result<(), ProtocolError> {
    while let Some(request) =
        protocol::read_frame::<TestRequest, _>(&mut stream, max_msg_size).await?
    {
        let response = worker.test(request).await;
        protocol::write_frame(&mut stream, &response, max_msg_size).await?;
    }
    Ok(())
}

/// Executes test requests, one at a time.
pub struct Worker {
    repo_root: PathBuf,
    config: Configuration,
    running: Mutex<()>,
}

impl Worker {
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            config: Configuration::default(),
            running: Mutex::new(()),
        }
    }

    /// Handles one `Test` RPC.
    ///
    /// Failures to set the test up come back as `success = false` with the
    /// reason in `messages`; only transport problems fail the RPC itself.
    pub async fn test(&self, request: TestRequest) -> TestResponse {
        let _guard = self.running.lock().await;

        let Some(rule) = request.rule.clone() else {
            return error_response(None, "Missing rule in test request".to_string());
        };

        // Build a sufficient representation of the target that the normal
        // test-running code works on it.
        let mut state = BuildState::new(self.config.clone());
        state.need_coverage = request.coverage;
        state.test_args = request.test_name.clone();
        if !request.path.is_empty() {
            state.config.build.path = request.path.clone();
        }
        let mut target = BuildTarget::new(BuildLabel::new(&rule.package_name, &rule.name));
        target.test_command = request.command.clone();
        target.labels = request.labels.clone();
        target.no_test_output = request.no_output;
        if request.timeout > 0 {
            target.test_timeout = Some(Duration::from_secs(request.timeout as u64));
        }
        info!("Received test request for {}", target.label);

        let dir = target.test_dir(&self.repo_root);
        let response = self.run(&request, &state, &mut target, &dir).await;
        // Whatever happened above, the scratch directory goes away.
        self.cleanup(&dir);
        response
    }

    async fn run(
        &self,
        request: &TestRequest,
        state: &BuildState,
        target: &mut BuildTarget,
        dir: &Path,
    ) -> TestResponse {
        let binary = request.binary.as_ref().filter(|b| !b.filename.is_empty());
        if binary.is_none() && request.data.is_empty() {
            return error_response(
                request.rule.clone(),
                format!("Missing test binary and data files for {}", target.label),
            );
        }
        if let Some(binary) = binary {
            target.add_output(&binary.filename);
            if let Err(e) = write_data_file(dir, binary) {
                return error_response(
                    request.rule.clone(),
                    format!("Failed to write test file: {e}"),
                );
            }
        }
        for data_file in &request.data {
            if let Err(e) = write_data_file(dir, data_file) {
                return error_response(
                    request.rule.clone(),
                    format!("Failed to write test data file: {e}"),
                );
            }
        }
        match runner::run_test(state, target, &self.repo_root).await {
            Ok(run) => {
                if !run.exit_success {
                    error!(
                        "Test {} failed: {}",
                        target.label,
                        String::from_utf8_lossy(&run.output)
                    );
                }
                TestResponse {
                    rule: request.rule.clone(),
                    success: true,
                    exit_success: run.exit_success,
                    output: run.output,
                    results: run.results,
                    coverage: run.coverage,
                    messages: Vec::new(),
                }
            }
            Err(e) => {
                // The test could not even be started; that's still a test
                // failure rather than a structural one.
                error!("Failed to start test {}: {e}", target.label);
                TestResponse {
                    rule: request.rule.clone(),
                    success: true,
                    exit_success: false,
                    output: format!("Failed to start test: {e}").into_bytes(),
                    ..TestResponse::default()
                }
            }
        }
    }

    /// Removes the temporary test directory. Runs on every exit path, so a
    /// missing directory is not an error.
    fn cleanup(&self, dir: &Path) {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("Failed to remove temporary test directory: {e}");
            }
        }
    }
}

/// Writes one received file into the test directory, creating any parent
/// directories, executable by everyone.
fn write_data_file(dir: &Path, data_file: &DataFile) -> io::Result<()> {
    let filename = dir.join(&data_file.filename);
    if let Some(parent) = filename.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!("Writing temp test file {}", filename.display());
    std::fs::write(&filename, &data_file.contents)?;
    let mut perms = std::fs::metadata(&filename)?.permissions();
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o755);
    }
    std::fs::set_permissions(&filename, perms)
}

fn error_response(rule: Option<protocol::BuildLabel>, message: String) -> TestResponse {
    TestResponse {
        rule,
        success: false,
        messages: vec![message],
        ..TestResponse::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_rule_is_structural_failure() {
        let root = TempDir::new().unwrap();
        let worker = Worker::new(root.path().to_path_buf());
        let response = worker.test(TestRequest::default()).await;
        assert!(!response.success);
        assert!(response.messages[0].contains("rule"));
    }

    #[test]
    fn test_write_data_file_creates_parents() {
        let root = TempDir::new().unwrap();
        let data_file = DataFile {
            filename: "nested/dir/data.txt".to_string(),
            contents: b"hello".to_vec(),
        };
        write_data_file(root.path(), &data_file).unwrap();
        let written = root.path().join("nested/dir/data.txt");
        assert_eq!(std::fs::read(&written).unwrap(), b"hello");
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&written).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
