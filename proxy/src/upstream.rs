/// Upstream registry and nonce allocator
///
/// Many miners share one pool session. Each miner sharing a job gets a
/// distinct byte written into blob offset 42 (the first nonce byte, fixed
/// under implicit nicehash mode), so the nonce search spaces are disjoint.
/// Bytes run 1..=255 per job generation; 0 is reserved. When the newest
/// upstream runs out of bytes, the next miner gets a fresh pool session.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::config::{PoolEntry, MIN_BLOB_LEN, NONCE_OFFSET, USERAGENT};
use crate::stratum::client::PoolClient;
use crate::stratum::protocol::{Job, JobNotification};
use crate::stratum::server::{MinerConn, StratumServer};
use crate::stratum::target::job_target_to_diff;

pub struct Upstream {
    pub id: u64,
    /// Ids of the miners attached to this session.
    pub clients: Vec<u64>,
    /// Highest nonce byte handed out for the current job generation.
    pub top_nicehash: u8,
    pub client: Arc<PoolClient>,
    pub last_job: Job,
}

impl Upstream {
    fn next_nicehash(&mut self) -> u8 {
        self.top_nicehash += 1;
        self.top_nicehash
    }
}

struct RegistryState {
    upstreams: HashMap<u64, Upstream>,
    /// Upstream currently receiving new miners; 0 when there is none.
    latest: u64,
}

pub struct Registry {
    state: Mutex<RegistryState>,
    pool: PoolEntry,
    server: Arc<StratumServer>,
}

/// Overwrite the nonce byte of a job's blob for one miner. Everything but
/// byte 42 is preserved.
pub fn rewrite_blob(job: &Job, nicehash: u8) -> Result<Job> {
    let mut blob = hex::decode(&job.blob).context("decoding job blob")?;
    if blob.len() < MIN_BLOB_LEN {
        bail!("mining blob is too short: {}", hex::encode(&blob));
    }
    blob[NONCE_OFFSET] = nicehash;

    let mut rewritten = job.clone();
    rewritten.blob = hex::encode(blob);
    Ok(rewritten)
}

impl Registry {
    pub fn new(pool: PoolEntry, server: Arc<StratumServer>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState { upstreams: HashMap::new(), latest: 0 }),
            pool,
            server,
        })
    }

    /// Hand a miner a job with its own nonce byte. Reuses the miner's
    /// current upstream if it has one, else joins the newest session, else
    /// dials a fresh one. Returns the rewritten job, the pool-assigned
    /// client id and the upstream id.
    pub async fn get_job(self: &Arc<Self>, conn: &MinerConn) -> Result<(Job, String, u64)> {
        let mut state = self.state.lock().await;

        let job: Job;
        let client_id: String;
        let upstream_id: u64;
        let nicehash: u8;

        if conn.upstream() != 0 {
            let up = state
                .upstreams
                .get_mut(&conn.upstream())
                .ok_or_else(|| anyhow!("upstream {} is gone", conn.upstream()))?;
            nicehash = up.next_nicehash();
            job = up.last_job.clone();
            client_id = up.client.client_id.clone();
            upstream_id = up.id;
        } else if !exhausted(&state) {
            debug!("Reusing upstream job");
            let latest = state.latest;
            let up = state
                .upstreams
                .get_mut(&latest)
                .ok_or_else(|| anyhow!("latest upstream {} is gone", latest))?;
            nicehash = up.next_nicehash();
            up.clients.push(conn.id);
            job = up.last_job.clone();
            client_id = up.client.client_id.clone();
            upstream_id = up.id;
        } else {
            debug!("New upstream connection");
            let new_id = state.latest + 1;

            let (client, mut jobs) = PoolClient::connect(
                &self.pool.url,
                self.pool.tls,
                &self.pool.fingerprint,
                USERAGENT,
                &self.pool.user,
                &self.pool.pass,
            )
            .await?;

            let first_job = jobs.recv().await.ok_or_else(|| anyhow!("received nil job"))?;

            client_id = client.client_id.clone();
            state.upstreams.insert(
                new_id,
                Upstream {
                    id: new_id,
                    clients: vec![conn.id],
                    top_nicehash: 1,
                    client,
                    last_job: first_job.clone(),
                },
            );
            state.latest = new_id;

            let registry = Arc::clone(self);
            tokio::spawn(async move {
                registry.upstream_handler(new_id, jobs).await;
            });

            nicehash = 1;
            job = first_job;
            upstream_id = new_id;
        }

        debug!("Nicehash byte is {:02x}", nicehash);
        let job = rewrite_blob(&job, nicehash)?;
        Ok((job, client_id, upstream_id))
    }

    /// Current difficulty of an upstream's job plus the client handle, for
    /// the submit path.
    pub async fn submit_context(&self, upstream_id: u64) -> Result<(u64, Arc<PoolClient>)> {
        let state = self.state.lock().await;
        let up = state
            .upstreams
            .get(&upstream_id)
            .ok_or_else(|| anyhow!("upstream {} is gone", upstream_id))?;
        let diff = job_target_to_diff(&up.last_job.target)?;
        Ok((diff, Arc::clone(&up.client)))
    }

    /// Consume the job channel of one pool session. Every new job resets the
    /// nonce allocation and fans out fresh blobs; channel closure means the
    /// session died and the upstream is torn down.
    async fn upstream_handler(self: Arc<Self>, upstream_id: u64, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            debug!("Received new job with Job ID {}", job.job_id);
            let kicked = self.handle_new_job(upstream_id, job).await;
            for conn_id in kicked {
                crate::proxy::kick(&self.server, &self, conn_id).await;
            }
        }

        debug!("job channel closed for upstream {}", upstream_id);
        self.close_upstream(upstream_id).await;
    }

    /// Install a new job and push rewritten copies to every attached miner
    /// still present in the connection table. Returns miners whose job
    /// could not be rebuilt; the caller kicks them outside these locks.
    async fn handle_new_job(&self, upstream_id: u64, job: Job) -> Vec<u64> {
        let mut kicked = Vec::new();

        let mut state = self.state.lock().await;
        let Some(up) = state.upstreams.get_mut(&upstream_id) else {
            return kicked;
        };
        debug!("New job for upstream {}", upstream_id);

        up.top_nicehash = 0;
        up.last_job = job;
        let client_ids = up.clients.clone();

        let connections = self.server.connections.lock().await;
        for conn_id in client_ids {
            let Some(conn) = connections.iter().find(|conn| conn.id == conn_id) else {
                continue;
            };
            // Still present in the state map; checked above.
            let Some(up) = state.upstreams.get_mut(&upstream_id) else { break };
            let nicehash = up.next_nicehash();

            match rewrite_blob(&up.last_job, nicehash) {
                Ok(job) => {
                    debug!("Refreshing job for connection {}", conn.id);
                    if let Err(err) = conn.send(&JobNotification::new(job)).await {
                        error!("{}", err);
                    }
                }
                Err(err) => {
                    warn!("{}", err);
                    kicked.push(conn_id);
                }
            }
        }

        kicked
    }

    /// Detach a miner from its upstream; closing the upstream when its last
    /// miner leaves.
    pub async fn detach(&self, conn_id: u64, upstream_id: u64) {
        if upstream_id == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        let Some(up) = state.upstreams.get_mut(&upstream_id) else {
            return;
        };
        if let Some(index) = up.clients.iter().position(|&id| id == conn_id) {
            up.clients.swap_remove(index);
        }
        if up.clients.is_empty() {
            remove_upstream(&mut state, upstream_id);
        }
    }

    pub async fn close_upstream(&self, upstream_id: u64) {
        let mut state = self.state.lock().await;
        remove_upstream(&mut state, upstream_id);
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.upstreams.len()
    }

    /// (latest upstream id, its top_nicehash) — observability for tests and
    /// the dashboard.
    pub async fn latest(&self) -> (u64, u8) {
        let state = self.state.lock().await;
        let top = state.upstreams.get(&state.latest).map(|up| up.top_nicehash).unwrap_or(0);
        (state.latest, top)
    }
}

/// Whether new miners need a fresh upstream: none exist, the newest one ran
/// out of nonce bytes, or the latest id dangles.
fn exhausted(state: &RegistryState) -> bool {
    match state.upstreams.get(&state.latest) {
        Some(up) => up.top_nicehash == 0xff,
        None => true,
    }
}

fn remove_upstream(state: &mut RegistryState, upstream_id: u64) {
    let Some(up) = state.upstreams.remove(&upstream_id) else {
        return;
    };
    up.client.close();
    if state.latest == upstream_id && state.upstreams.is_empty() {
        debug!("Last upstream destroyed.");
        state.latest = 0;
    }
}
