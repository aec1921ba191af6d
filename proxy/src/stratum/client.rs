/// Upstream Stratum client
///
/// One TCP or TLS session to a pool. The session multiplexes two flows over
/// a single socket: replies to the one in-flight request (submits), and
/// server-pushed `job` notifications. A dispatcher task splits them onto a
/// response channel and a job channel; closure of the job channel is how
/// consumers observe the session dying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LOGIN_READ_TIMEOUT, POOL_READ_TIMEOUT, WRITE_TIMEOUT};
use crate::stratum::protocol::{
    frame_reader, read_frame, write_frame, BoxStream, FrameReader, Job, PoolLoginParams,
    PoolLoginRequest, PoolLoginResponse, PoolResponse, PoolSubmitParams, PoolSubmitRequest,
    StreamWriter,
};
use crate::stratum::tls;

const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct PoolClient {
    destination: String,
    /// Session id the pool assigned at login; echoed in every submit.
    pub client_id: String,
    alive: AtomicBool,
    shutdown: CancellationToken,
    writer: Mutex<StreamWriter>,
    /// Replies to the in-flight request. Locking the receiver is what
    /// serializes submits: one request, one awaited response.
    responses: Mutex<mpsc::Receiver<PoolResponse>>,
}

impl PoolClient {
    /// Dial the pool, log in, and start the dispatcher. Returns the client
    /// and the job channel; the first job (from the login response) is the
    /// channel's first item.
    pub async fn connect(
        destination: &str,
        use_tls: bool,
        pinned_fingerprint: &str,
        agent: &str,
        login: &str,
        pass: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Job>)> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(destination))
            .await
            .map_err(|_| anyhow!("dial timeout: {}", destination))?
            .with_context(|| format!("connecting to {}", destination))?;

        let stream: BoxStream = if use_tls {
            let host = destination.split(':').next().unwrap_or(destination).to_string();
            let server_name = rustls::pki_types::ServerName::try_from(host)
                .map_err(|e| anyhow!("invalid pool host name: {}", e))?;
            let pin = if pinned_fingerprint.is_empty() {
                None
            } else {
                Some(pinned_fingerprint.to_string())
            };
            let connector = TlsConnector::from(Arc::new(tls::client_config(pin)));
            Box::new(connector.connect(server_name, tcp).await?)
        } else {
            Box::new(tcp)
        };

        let (read_half, mut writer) = tokio::io::split(stream);
        let mut frames = frame_reader(read_half);

        let request = PoolLoginRequest {
            id: 1,
            method: "login".into(),
            params: PoolLoginParams {
                login: login.to_string(),
                pass: pass.to_string(),
                agent: agent.to_string(),
            },
        };
        debug!("sending login to pool {}", destination);
        write_frame(&mut writer, &request, WRITE_TIMEOUT).await?;

        let response: PoolLoginResponse = read_frame(&mut frames, LOGIN_READ_TIMEOUT).await?;
        let result = match response.result {
            Some(result) => result,
            None => {
                if let Some(error) = response.error {
                    warn!("pool login error: {}", error);
                    bail!("stratum server error");
                }
                bail!("malformed login response");
            }
        };
        let first_job = result.job.ok_or_else(|| anyhow!("malformed login response"))?;

        let (job_tx, job_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(1);

        let client = Arc::new(Self {
            destination: destination.to_string(),
            client_id: result.id,
            alive: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            writer: Mutex::new(writer),
            responses: Mutex::new(response_rx),
        });
        client.spawn_dispatcher(frames, first_job, job_tx, response_tx);

        Ok((client, job_rx))
    }

    /// Route incoming frames until the session dies: jobs to the job
    /// channel, everything else to the response channel. Dropping the
    /// senders on exit is what signals death downstream.
    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut frames: FrameReader,
        first_job: Job,
        job_tx: mpsc::Sender<Job>,
        response_tx: mpsc::Sender<PoolResponse>,
    ) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if job_tx.send(first_job).await.is_err() {
                client.close();
                return;
            }

            loop {
                let line = tokio::select! {
                    _ = client.shutdown.cancelled() => break,
                    read = tokio::time::timeout(POOL_READ_TIMEOUT, frames.next()) => {
                        match read {
                            Err(_) => {
                                warn!("pool read deadline elapsed: {}", client.destination);
                                break;
                            }
                            Ok(None) => break,
                            Ok(Some(Err(err))) => {
                                if client.is_alive() {
                                    warn!("failed to read jobs from pool: {}", err);
                                } else {
                                    debug!("failed to read jobs from pool: {}", err);
                                }
                                break;
                            }
                            Ok(Some(Ok(line))) => line,
                        }
                    }
                };

                let response: PoolResponse = match serde_json::from_str(line.trim()) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!("json unmarshal failed: {}", err);
                        break;
                    }
                };

                if response.method == "job" {
                    let Some(job) = response.params else {
                        warn!("job notification without params from {}", client.destination);
                        break;
                    };
                    if job_tx.send(job).await.is_err() {
                        break;
                    }
                } else if response_tx.send(response).await.is_err() {
                    break;
                }
            }

            client.close();
        });
    }

    /// Submit one share and wait for the pool's reply. The response id must
    /// match the request id; anything else fails the submit.
    pub async fn submit_work(
        &self,
        nonce: &str,
        job_id: &str,
        result: &str,
        request_id: u64,
    ) -> Result<PoolResponse> {
        if !self.is_alive() {
            bail!("client is not alive");
        }

        let mut responses = self.responses.lock().await;

        let request = PoolSubmitRequest {
            id: request_id,
            method: "submit".into(),
            params: PoolSubmitParams {
                id: self.client_id.clone(),
                job_id: job_id.to_string(),
                nonce: nonce.to_string(),
                result: result.to_string(),
            },
        };
        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut writer, &request, WRITE_TIMEOUT)
                .await
                .context("failed to submit work")?;
        }

        let response = responses
            .recv()
            .await
            .ok_or_else(|| anyhow!("failed to submit work: empty response"))?;
        if response.id != request_id {
            warn!(
                "unexpected response id: got: {} expected: {}",
                response.id, request_id
            );
            bail!("failed to submit work: unexpected response");
        }
        Ok(response)
    }

    /// Disconnected stand-in for tests that never touch the pool.
    #[cfg(test)]
    pub(crate) fn stub() -> Arc<Self> {
        let (near, _far) = tokio::io::duplex(64);
        let (_read, writer) = tokio::io::split(Box::new(near) as BoxStream);
        let (_tx, responses) = mpsc::channel(1);
        Arc::new(Self {
            destination: "stub".into(),
            client_id: "stub".into(),
            alive: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            writer: Mutex::new(writer),
            responses: Mutex::new(responses),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Idempotent. Flips the alive flag and cancels the dispatcher, which
    /// drops the socket and closes both channels.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}
