/// Stratum wire protocol
///
/// One JSON object per newline-terminated line, in both directions. The
/// reader is bounded in frame size and wrapped in a per-call deadline; the
/// writer serializes once and sends frame + newline in a single write.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::MAX_REQUEST_SIZE;

/// Any stream the proxy can speak over (plain TCP or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;
pub type StreamReader = tokio::io::ReadHalf<BoxStream>;
pub type StreamWriter = tokio::io::WriteHalf<BoxStream>;

/// Line-framed reader with the frame-size cap applied.
pub type FrameReader = FramedRead<StreamReader, LinesCodec>;

pub fn frame_reader(reader: StreamReader) -> FrameReader {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_REQUEST_SIZE))
}

/// Read one frame and parse it. Fails on oversized frames, invalid JSON,
/// closed streams and elapsed deadlines.
pub async fn read_frame<T: DeserializeOwned>(
    frames: &mut FrameReader,
    deadline: Duration,
) -> Result<T> {
    let line = tokio::time::timeout(deadline, frames.next())
        .await
        .map_err(|_| anyhow!("read deadline exceeded"))?
        .ok_or_else(|| anyhow!("connection closed"))??;
    let parsed = serde_json::from_str(line.trim())?;
    Ok(parsed)
}

/// Serialize a frame and write it, newline included, in one write.
pub async fn write_frame<T: Serialize>(
    writer: &mut StreamWriter,
    frame: &T,
    deadline: Duration,
) -> Result<()> {
    let mut data = serde_json::to_vec(frame)?;
    if data.len() >= MAX_REQUEST_SIZE {
        bail!("frame too large: {} bytes", data.len());
    }
    data.push(b'\n');
    tokio::time::timeout(deadline, writer.write_all(&data))
        .await
        .map_err(|_| anyhow!("write deadline exceeded"))??;
    Ok(())
}

/// A mining job as it travels on the wire. RandomX jobs also carry height
/// and seed_hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub algo: String,
    #[serde(default)]
    pub blob: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub target: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub seed_hash: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i32,
    pub message: String,
}

// ---- downstream (miner-facing) frames ----

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: LoginParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub algo: Vec<String>,
    /// Non-standard; some miners announce explicit nicehash support.
    #[serde(default)]
    pub nicehash_support: bool,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub id: u64,
    pub status: String,
    pub result: LoginResult,
    pub error: Option<ErrorReply>,
}

#[derive(Debug, Serialize)]
pub struct LoginResult {
    pub id: String,
    pub job: Job,
    pub extensions: Vec<String>,
    pub status: String,
}

/// Share-loop request. Submit params are flattened here; other methods
/// (keepalived, unknown) leave them defaulted.
#[derive(Debug, Deserialize)]
pub struct MinerRequest {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: SubmitParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct Reply {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl Reply {
    pub fn ok(id: u64, result: Value) -> Self {
        Self { id, jsonrpc: "2.0".into(), error: None, result: Some(result) }
    }
}

/// Server-push job notification, sent to miners on upstream job changes.
#[derive(Debug, Serialize)]
pub struct JobNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Job,
}

impl JobNotification {
    pub fn new(job: Job) -> Self {
        Self { jsonrpc: "2.0".into(), method: "job".into(), params: job }
    }
}

// ---- upstream (pool-facing) frames ----

#[derive(Debug, Serialize)]
pub struct PoolLoginRequest {
    pub id: u64,
    pub method: String,
    pub params: PoolLoginParams,
}

#[derive(Debug, Serialize)]
pub struct PoolLoginParams {
    pub login: String,
    pub pass: String,
    pub agent: String,
}

#[derive(Debug, Deserialize)]
pub struct PoolLoginResponse {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub result: Option<PoolLoginResult>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct PoolLoginResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job: Option<Job>,
}

#[derive(Debug, Serialize)]
pub struct PoolSubmitRequest {
    pub id: u64,
    pub method: String,
    pub params: PoolSubmitParams,
}

#[derive(Debug, Serialize)]
pub struct PoolSubmitParams {
    pub id: String,
    pub job_id: String,
    pub nonce: String,
    pub result: String,
}

/// Anything the pool sends after login: job pushes (`method == "job"`) or
/// replies to the one in-flight request. Replies are forwarded verbatim to
/// the miner on the submit path, so `result` and `error` stay raw: their
/// bytes pass through untouched instead of being re-ordered by a decode and
/// re-encode round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolResponse {
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<RawValue>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// One directed pipe: whatever goes into the writer comes out of the
    /// frame reader on the far end.
    fn pipe() -> (StreamWriter, FrameReader) {
        let (a, b) = duplex(MAX_REQUEST_SIZE * 4);
        let (_ar, aw) = tokio::io::split(Box::new(a) as BoxStream);
        let (br, _bw) = tokio::io::split(Box::new(b) as BoxStream);
        (aw, frame_reader(br))
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (mut aw, mut br) = pipe();

        let notify = JobNotification::new(Job {
            algo: "rx/0".into(),
            blob: "00".repeat(44),
            job_id: "J1".into(),
            target: "ffffff7f".into(),
            height: 1,
            seed_hash: "ab".repeat(32),
        });
        write_frame(&mut aw, &notify, Duration::from_secs(1)).await.unwrap();

        let parsed: PoolResponse = read_frame(&mut br, Duration::from_secs(1)).await.unwrap();
        assert_eq!(parsed.method, "job");
        let job = parsed.params.unwrap();
        assert_eq!(job.job_id, "J1");
        assert_eq!(job.height, 1);
        assert_eq!(job.target, "ffffff7f");
    }

    #[tokio::test]
    async fn rejects_oversized_frames() {
        let (mut aw, mut br) = pipe();

        let huge = format!("{{\"id\":1,\"method\":\"{}\"}}\n", "x".repeat(MAX_REQUEST_SIZE));
        aw.write_all(huge.as_bytes()).await.unwrap();

        let res: Result<MinerRequest> = read_frame(&mut br, Duration::from_secs(1)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn read_deadline_elapses() {
        let (_aw, mut br) = pipe();

        let started = std::time::Instant::now();
        let res: Result<MinerRequest> = read_frame(&mut br, Duration::from_millis(50)).await;
        assert!(res.is_err());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn rejects_invalid_json() {
        let (mut aw, mut br) = pipe();
        aw.write_all(b"not json at all\n").await.unwrap();
        let res: Result<MinerRequest> = read_frame(&mut br, Duration::from_secs(1)).await;
        assert!(res.is_err());
    }

    #[test]
    fn login_request_parses_xmrig_shape() {
        let raw = r#"{"id":7,"method":"login","params":{"login":"w","pass":"x","agent":"xmrig"}}"#;
        let req: LoginRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.id, 7);
        assert_eq!(req.method, "login");
        assert_eq!(req.params.login, "w");
        assert_eq!(req.params.pass, "x");
        assert_eq!(req.params.agent, "xmrig");
        assert!(!req.params.nicehash_support);
    }

    #[test]
    fn keepalived_reply_serializes_flat() {
        let reply = Reply::ok(99, serde_json::json!({"status": "KEEPALIVED"}));
        let raw = serde_json::to_string(&reply).unwrap();
        assert_eq!(raw, r#"{"id":99,"jsonrpc":"2.0","result":{"status":"KEEPALIVED"}}"#);
    }

    #[test]
    fn pool_reply_forwards_verbatim_shape() {
        let raw = r#"{"id":5,"jsonrpc":"2.0","result":{"status":"OK"}}"#;
        let resp: PoolResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_string(&resp).unwrap(), raw);
    }

    #[test]
    fn pool_reply_preserves_nested_key_order() {
        // "status" before "reason" is not alphabetical; a decode/re-encode
        // through a sorted map would flip them.
        let raw = r#"{"id":5,"jsonrpc":"2.0","result":{"status":"OK","reason":"fast path"}}"#;
        let resp: PoolResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_string(&resp).unwrap(), raw);

        let raw = r#"{"id":6,"jsonrpc":"2.0","error":{"message":"Low difficulty share","code":-1}}"#;
        let resp: PoolResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(serde_json::to_string(&resp).unwrap(), raw);
    }

    #[test]
    fn non_randomx_job_omits_optional_fields() {
        let job = Job { algo: "cn/2".into(), blob: "aa".into(), job_id: "j".into(), target: "ffffffff".into(), ..Default::default() };
        let raw = serde_json::to_string(&job).unwrap();
        assert!(!raw.contains("height"));
        assert!(!raw.contains("seed_hash"));
    }
}
