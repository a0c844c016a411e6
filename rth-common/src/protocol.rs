//! Wire protocol between the build host and remote test workers.
//!
//! One service, one method: `TestWorker.Test(TestRequest) -> TestResponse`.
//! Messages are protobuf-encoded and carried over TCP as 4-byte big-endian
//! length-prefixed frames. The maximum frame size is agreed out of band (the
//! worker's `--max_msg_size` flag) and enforced on both read and write so a
//! misbehaving peer cannot make us buffer unbounded data.

use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Port the test worker serves on by default.
pub const DEFAULT_PORT: u16 = 7792;

/// Identifies the target a test request concerns.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BuildLabel {
    #[prost(string, tag = "1")]
    pub package_name: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

/// One file shipped to the worker: the test binary or a runtime data file.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DataFile {
    /// Path relative to the test directory.
    #[prost(string, tag = "1")]
    pub filename: String,
    #[prost(bytes = "vec", tag = "2")]
    pub contents: Vec<u8>,
}

/// Everything the worker needs to run one test.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TestRequest {
    #[prost(message, optional, tag = "1")]
    pub rule: Option<BuildLabel>,
    /// Shell command template to execute.
    #[prost(string, tag = "2")]
    pub command: String,
    /// Whether coverage output is expected.
    #[prost(bool, tag = "3")]
    pub coverage: bool,
    /// Optional test-name filter.
    #[prost(string, tag = "4")]
    pub test_name: String,
    /// Timeout in seconds; 0 means the worker's configured default.
    #[prost(int32, tag = "5")]
    pub timeout: i32,
    #[prost(string, repeated, tag = "6")]
    pub labels: Vec<String>,
    /// True if the test produces no results document.
    #[prost(bool, tag = "7")]
    pub no_output: bool,
    /// Directories to prepend to the executable search path.
    #[prost(string, repeated, tag = "8")]
    pub path: Vec<String>,
    /// The test executable; may be absent for data-only tests.
    #[prost(message, optional, tag = "9")]
    pub binary: Option<DataFile>,
    /// Runtime data files, in order.
    #[prost(message, repeated, tag = "10")]
    pub data: Vec<DataFile>,
}

/// The worker's answer to a [`TestRequest`].
///
/// `success` is structural: the worker accepted the request and got as far
/// as running the test. `exit_success` reports the test's own exit status
/// and is only meaningful when `success` is true.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TestResponse {
    #[prost(message, optional, tag = "1")]
    pub rule: Option<BuildLabel>,
    #[prost(bool, tag = "2")]
    pub success: bool,
    /// Error descriptions when `success` is false.
    #[prost(string, repeated, tag = "3")]
    pub messages: Vec<String>,
    #[prost(bool, tag = "4")]
    pub exit_success: bool,
    /// Combined stdout/stderr of the test run.
    #[prost(bytes = "vec", tag = "5")]
    pub output: Vec<u8>,
    /// Raw results documents, one per results file produced.
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub results: Vec<Vec<u8>>,
    /// Raw coverage document, when coverage was requested.
    #[prost(bytes = "vec", tag = "7")]
    pub coverage: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Writes one length-prefixed message frame.
pub async fn write_frame<M, W>(stream: &mut W, msg: &M, max_size: usize) -> Result<(), ProtocolError>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let encoded = msg.encode_to_vec();
    if encoded.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: encoded.len(),
            max: max_size,
        });
    }
    stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed message frame.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly before the
/// length prefix.
pub async fn read_frame<M, R>(stream: &mut R, max_size: usize) -> Result<Option<M>, ProtocolError>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(M::decode(buf.as_slice())?))
}
