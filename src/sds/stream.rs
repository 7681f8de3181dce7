//! Per-stream discovery protocol
//!
//! One driver task serves one `StreamSecrets` call. A dedicated receiver
//! task pulls requests off the blocking stream read, validates the peer on
//! each one and forwards them over a channel; the driver multiplexes those
//! with renewal snapshots and the service-wide shutdown signal.
//!
//! Protocol state per stream: the last sent version and nonce, the last
//! accepted resource names, and the renewer that produced them. A request is
//! answered only when it actually changes the subscription; ACKs, NACKs and
//! stale nonces leave the stream quiet until the next renewal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};

use super::renewer::{SecretRenewer, SecretSnapshot};
use super::response::{build_discovery_response, version_info_now};
use super::validator::{PeerIdentity, PeerValidator};
use crate::ca::Authority;
use crate::logging::RequestLog;
use crate::proto::{DiscoveryRequest, DiscoveryResponse};

/// Everything a stream driver needs from the service
pub(crate) struct StreamContext {
    pub authority: Arc<dyn Authority>,
    pub validator: PeerValidator,
    pub roots_refresh: Duration,
    pub shutdown: CancellationToken,
    pub log: RequestLog,
}

enum Inbound {
    Request(Box<DiscoveryRequest>),
    Closed,
    Failed(Status),
}

/// Aborts the receiver task when the driver unwinds.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives one secrets stream to completion. Returns `Ok(())` on client
/// close or shutdown; any fatal error becomes the stream's status.
pub(crate) async fn drive(
    ctx: StreamContext,
    peer: PeerIdentity,
    mut inbound: Streaming<DiscoveryRequest>,
    out: mpsc::Sender<Result<DiscoveryResponse, Status>>,
) -> Result<(), Status> {
    let (req_tx, mut req_rx) = mpsc::channel::<Inbound>(1);
    let validator = ctx.validator.clone();
    let receiver = tokio::spawn(async move {
        loop {
            match inbound.message().await {
                Ok(Some(request)) => {
                    if let Err(status) = validator.validate(&peer) {
                        let _ = req_tx.send(Inbound::Failed(status)).await;
                        return;
                    }
                    if req_tx.send(Inbound::Request(Box::new(request))).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = req_tx.send(Inbound::Closed).await;
                    return;
                }
                Err(status) => {
                    let _ = req_tx.send(Inbound::Failed(status)).await;
                    return;
                }
            }
        }
    });
    let _receiver = AbortOnDrop(receiver);

    let mut version = String::new();
    let mut nonce = String::new();
    let mut resources: Vec<String> = Vec::new();
    let mut renewer: Option<SecretRenewer> = None;
    let mut updates: Option<mpsc::Receiver<SecretSnapshot>> = None;
    let mut snapshot = SecretSnapshot::default();
    let mut last_request: Option<Box<DiscoveryRequest>> = None;
    let mut is_renewal = false;
    let mut started = Instant::now();

    loop {
        tokio::select! {
            inbound = req_rx.recv() => {
                started = Instant::now();
                is_renewal = false;
                let request = match inbound.unwrap_or(Inbound::Closed) {
                    Inbound::Request(request) => request,
                    Inbound::Closed => return Ok(()),
                    Inbound::Failed(status) => {
                        ctx.log.proto_event(None, started, "receive failed", Some(status.message()));
                        return Err(status);
                    }
                };

                // NACK: the client rejected the last response; log and wait
                if request.error_detail.is_some() {
                    ctx.log.proto_event(Some(&request), started, "NACK", None);
                    continue;
                }
                // nonce and version rules only apply once a request has been
                // accepted on this stream
                if last_request.is_some() {
                    if request.response_nonce != nonce {
                        ctx.log.proto_event(
                            Some(&request),
                            started,
                            "invalid response nonce",
                            Some("invalid response nonce"),
                        );
                        continue;
                    }
                    if request.version_info.is_empty() {
                        // fresh subscription on a live stream
                        version = version_info_now();
                    } else if request.version_info == version {
                        ctx.log.proto_event(Some(&request), started, "ACK", None);
                        continue;
                    } else {
                        // out of protocol; treat as a fresh subscription
                        version = version_info_now();
                    }
                } else {
                    version = version_info_now();
                }

                let mut tokens = Vec::with_capacity(request.resource_names.len());
                for name in &request.resource_names {
                    match ctx.authority.issue_token(name).await {
                        Ok(token) => tokens.push(token),
                        Err(err) => {
                            ctx.log.proto_event(
                                Some(&request),
                                started,
                                "error generating token",
                                Some(&err.to_string()),
                            );
                            return Err(Status::internal(err.to_string()));
                        }
                    }
                }

                let (next, next_updates) =
                    match SecretRenewer::new(ctx.authority.as_ref(), &tokens, ctx.roots_refresh).await {
                        Ok(built) => built,
                        Err(err) => {
                            ctx.log.proto_event(
                                Some(&request),
                                started,
                                "error creating renewer",
                                Some(&err.to_string()),
                            );
                            return Err(Status::internal(err.to_string()));
                        }
                    };
                if let Some(old) = renewer.take() {
                    old.stop();
                }
                snapshot = next.snapshot().await;
                renewer = Some(next);
                updates = Some(next_updates);
                resources = request.resource_names.clone();
                last_request = Some(request);
            }
            snap = recv_update(&mut updates) => {
                started = Instant::now();
                is_renewal = true;
                match snap {
                    Some(snap) => {
                        version = version_info_now();
                        snapshot = snap;
                    }
                    None => {
                        // the renewer wound down; nothing to push until a new
                        // request installs another one
                        updates = None;
                        continue;
                    }
                }
            }
            _ = ctx.shutdown.cancelled() => return Ok(()),
        }

        let response = match build_discovery_response(&resources, &version, &snapshot) {
            Ok(response) => response,
            Err(err) => {
                ctx.log.proto_event(
                    last_request.as_deref(),
                    started,
                    "error creating discovery response",
                    Some(&err.to_string()),
                );
                return Err(Status::internal(err.to_string()));
            }
        };
        nonce = response.nonce.clone();

        if out.send(Ok(response)).await.is_err() {
            // the response stream is gone; the client hung up mid-send
            ctx.log.proto_event(last_request.as_deref(), started, "send failed", Some("stream closed"));
            return Ok(());
        }

        let msg = if snapshot.certificates.is_empty() {
            "trusted CA sent"
        } else if is_renewal {
            "certificate renewed"
        } else {
            "certificate sent"
        };
        ctx.log.sent(last_request.as_deref(), started, msg, &nonce);
    }
}

async fn recv_update(updates: &mut Option<mpsc::Receiver<SecretSnapshot>>) -> Option<SecretSnapshot> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
