//! Service façade
//!
//! Registers the secret discovery service with tonic and owns what streams
//! share: the CA authority, the peer policy and the shutdown signal.
//! `StreamSecrets` hands each stream to its own driver task; `FetchSecrets`
//! is the one-shot variant; `DeltaSecrets` is not implemented.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;

use super::renewer::SecretRenewer;
use super::response::{build_discovery_response, version_info_now};
use super::stream::{drive, StreamContext};
use super::validator::{PeerIdentity, PeerValidator};
use super::DEFAULT_ROOTS_REFRESH;
use crate::ca::{Authority, CaClient, Provisioner};
use crate::config::Config;
use crate::error::Error;
use crate::logging::{LoggerConfig, RequestLog};
use crate::proto::{
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse, SecretDiscoveryService,
    SecretDiscoveryServiceServer,
};

/// The secret discovery service
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

struct Inner {
    authority: Arc<dyn Authority>,
    validator: PeerValidator,
    roots_refresh: Duration,
    trace_header: String,
    shutdown: CancellationToken,
}

impl Service {
    /// Creates a service talking to the CA named in the configuration.
    pub fn new(config: &Config) -> Result<Service, Error> {
        let logger = LoggerConfig::from_value(&config.logger)?;
        let provisioner = Provisioner::new(&config.provisioner)?;
        let authority = Arc::new(CaClient::new(provisioner, &config.provisioner)?);
        Ok(Service::with_authority(config, &logger, authority))
    }

    /// Creates a service over any authority implementation.
    pub fn with_authority(
        config: &Config,
        logger: &LoggerConfig,
        authority: Arc<dyn Authority>,
    ) -> Service {
        Service {
            inner: Arc::new(Inner {
                authority,
                validator: PeerValidator {
                    authorized_identity: config.authorized_identity.clone(),
                    authorized_fingerprint: config.authorized_fingerprint.clone(),
                    is_tcp: config.is_tcp(),
                },
                roots_refresh: DEFAULT_ROOTS_REFRESH,
                trace_header: logger.trace_header(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Wraps the service for registration with a tonic server.
    pub fn into_service(self) -> SecretDiscoveryServiceServer<Service> {
        SecretDiscoveryServiceServer::new(self)
    }

    /// Signals shutdown. Every live stream observes the signal and returns
    /// cleanly.
    pub fn stop(&self) {
        info!("stopping secret discovery service");
        self.inner.shutdown.cancel();
    }

    fn request_log<T>(&self, method: &'static str, request: &Request<T>) -> RequestLog {
        let peer = PeerIdentity::from_request(request);
        RequestLog::new(
            method,
            request.metadata(),
            &self.inner.trace_header,
            peer.addr,
            peer.common_name(),
        )
    }
}

impl Inner {
    async fn fetch(
        &self,
        request: DiscoveryRequest,
        log: &RequestLog,
    ) -> Result<DiscoveryResponse, Status> {
        let started = Instant::now();

        let mut tokens = Vec::with_capacity(request.resource_names.len());
        for name in &request.resource_names {
            let token = self.authority.issue_token(name).await.map_err(|err| {
                log.proto_event(Some(&request), started, "error generating token", Some(&err.to_string()));
                Status::internal(err.to_string())
            })?;
            tokens.push(token);
        }

        // a one-shot renewer: take the initial snapshot and stop it
        let (renewer, _updates) =
            SecretRenewer::new(self.authority.as_ref(), &tokens, self.roots_refresh)
                .await
                .map_err(|err| {
                    log.proto_event(Some(&request), started, "error creating renewer", Some(&err.to_string()));
                    Status::internal(err.to_string())
                })?;
        let snapshot = renewer.snapshot().await;
        renewer.stop();

        let response =
            build_discovery_response(&request.resource_names, &version_info_now(), &snapshot)
                .map_err(|err| {
                    log.proto_event(
                        Some(&request),
                        started,
                        "error creating discovery response",
                        Some(&err.to_string()),
                    );
                    Status::internal(err.to_string())
                })?;
        log.sent(Some(&request), started, "certificate sent", &response.nonce);
        Ok(response)
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for Service {
    type StreamSecretsStream =
        Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send + 'static>>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let log = self.request_log("StreamSecrets", &request);
        let peer = PeerIdentity::from_request(&request);
        let inbound = request.into_inner();

        let ctx = StreamContext {
            authority: self.inner.authority.clone(),
            validator: self.inner.validator.clone(),
            roots_refresh: self.inner.roots_refresh,
            shutdown: self.inner.shutdown.clone(),
            log: log.clone(),
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let code = match drive(ctx, peer, inbound, tx.clone()).await {
                Ok(()) => tonic::Code::Ok,
                Err(status) => {
                    let code = status.code();
                    let _ = tx.send(Err(status)).await;
                    code
                }
            };
            log.finish(code);
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let log = self.request_log("FetchSecrets", &request);
        let peer = PeerIdentity::from_request(&request);
        if let Err(status) = self.inner.validator.validate(&peer) {
            log.finish(status.code());
            return Err(status);
        }

        let result = self.inner.fetch(request.into_inner(), &log).await;
        log.finish(result.as_ref().map(|_| tonic::Code::Ok).unwrap_or_else(|s| s.code()));
        result.map(Response::new)
    }

    type DeltaSecretsStream =
        Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send + 'static>>;

    async fn delta_secrets(
        &self,
        request: Request<Streaming<crate::proto::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        let log = self.request_log("DeltaSecrets", &request);
        let status = Status::unimplemented("DeltaSecrets is not implemented");
        log.finish(status.code());
        Err(status)
    }
}
