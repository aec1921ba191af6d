/// Per-miner session handling
///
/// One task per miner: login handshake, then the share loop. Every error
/// path ends in a kick — close the socket, detach from the upstream, drop
/// from the connection table. Errors never leak across miners; a dying
/// upstream only takes its own miners with it.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{READ_TIMEOUT, WRITE_TIMEOUT};
use crate::stats::Stats;
use crate::stratum::protocol::{
    read_frame, LoginRequest, LoginResponse, LoginResult, MinerRequest, Reply,
};
use crate::stratum::server::{Incoming, StratumServer};
use crate::upstream::Registry;

/// Fan-in task: turns accepted connections into session tasks.
pub async fn dispatch_connections(
    server: Arc<StratumServer>,
    registry: Arc<Registry>,
    stats: Stats,
    mut incoming: mpsc::Receiver<Incoming>,
) {
    while let Some(accepted) = incoming.recv().await {
        let server = Arc::clone(&server);
        let registry = Arc::clone(&registry);
        let stats = stats.clone();
        tokio::spawn(async move {
            handle_connection(server, registry, stats, accepted).await;
        });
    }
}

pub async fn handle_connection(
    server: Arc<StratumServer>,
    registry: Arc<Registry>,
    stats: Stats,
    accepted: Incoming,
) {
    let Incoming { conn, mut frames } = accepted;

    // Miners speak first; the short write deadline covers this first read.
    let request: LoginRequest = match read_frame(&mut frames, WRITE_TIMEOUT).await {
        Ok(request) => request,
        Err(err) => {
            debug!("ReadJSON failed in server: {}", err);
            kick(&server, &registry, conn.id).await;
            return;
        }
    };

    let params = request.params;
    if params.agent.is_empty() || params.login.is_empty() || params.pass.is_empty() {
        debug!("client sent a malformed login request");
        kick(&server, &registry, conn.id).await;
        return;
    }

    debug!("Stratum server received connection");
    debug!("login {}", params.login);
    debug!("pass  {}", params.pass);
    debug!("algo  {:?}", params.algo);
    debug!("agent {}", params.agent);
    if params.nicehash_support {
        debug!("Client supports Nicehash mode (nicehash_support is true)");
    }

    let (job, client_id, upstream_id) = match registry.get_job(&conn).await {
        Ok(assigned) => assigned,
        Err(err) => {
            warn!("{}", err);
            kick(&server, &registry, conn.id).await;
            return;
        }
    };
    conn.set_upstream(upstream_id);

    let response = LoginResponse {
        id: request.id,
        status: "OK".into(),
        result: LoginResult {
            id: client_id,
            job,
            extensions: vec!["keepalive".into(), "nicehash".into()],
            status: "OK".into(),
        },
        error: None,
    };
    if let Err(err) = conn.send(&response).await {
        debug!("failed to send login response: {}", err);
    }

    // Share loop.
    loop {
        let request: MinerRequest = tokio::select! {
            _ = conn.closed().cancelled() => return,
            read = read_frame(&mut frames, READ_TIMEOUT) => match read {
                Ok(request) => request,
                Err(err) => {
                    debug!("ReadJSON failed in server: {}", err);
                    kick(&server, &registry, conn.id).await;
                    return;
                }
            }
        };

        match request.method.as_str() {
            "keepalived" => {
                let reply = Reply::ok(request.id, json!({"status": "KEEPALIVED"}));
                if let Err(err) = conn.send(&reply).await {
                    debug!("failed to send keepalive reply: {}", err);
                }
            }
            "submit" => {
                let (diff, client) = match registry.submit_context(conn.upstream()).await {
                    Ok(context) => context,
                    Err(err) => {
                        error!("{}", err);
                        kick(&server, &registry, conn.id).await;
                        return;
                    }
                };

                stats.record_share(diff);

                let params = request.params;
                let response = match client
                    .submit_work(&params.nonce, &params.job_id, &params.result, request.id)
                    .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        error!("{}", err);
                        kick(&server, &registry, conn.id).await;
                        return;
                    }
                };

                debug!("Sending SubmitWork response to client {:?}", response);
                if let Err(err) = conn.send(&response).await {
                    debug!("failed to forward submit response: {}", err);
                    kick(&server, &registry, conn.id).await;
                    return;
                }
            }
            other => {
                warn!("Unknown method {}. Skipping.", other);
            }
        }
    }
}

/// Close a miner and deregister it everywhere: registry detach first, then
/// the connection table, then the socket. The two locks are taken in
/// sequence, never nested, so this cannot collide with the fan-out's
/// registry-then-connections order. Safe to call twice; the second call
/// finds nothing to remove.
pub async fn kick(server: &StratumServer, registry: &Registry, conn_id: u64) {
    let conn = {
        let connections = server.connections.lock().await;
        let Some(conn) = connections.iter().find(|conn| conn.id == conn_id) else {
            return;
        };
        Arc::clone(conn)
    };
    registry.detach(conn_id, conn.upstream()).await;
    server.remove(conn_id).await;
    conn.close().await;
}
