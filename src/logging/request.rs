//! Per-request log records
//!
//! Every RPC gets a `RequestLog` handle carrying the correlation id (taken
//! from the configured trace header or generated), the method name and the
//! peer identity. Protocol events and the completion record all go through
//! it so the whole stream shares one request id.

use std::net::SocketAddr;
use std::time::Instant;

use tonic::metadata::MetadataMap;
use tracing::Level;

use super::{event_at, level_for};
use crate::proto::DiscoveryRequest;

/// Correlated log handle for a single RPC
#[derive(Debug, Clone)]
pub struct RequestLog {
    request_id: String,
    method: &'static str,
    accepted: Instant,
    peer_addr: Option<SocketAddr>,
    peer_identity: Option<String>,
}

impl RequestLog {
    /// Creates a handle for an incoming RPC, reusing the trace id from the
    /// request metadata when the client sent one.
    pub fn new(
        method: &'static str,
        metadata: &MetadataMap,
        trace_header: &str,
        peer_addr: Option<SocketAddr>,
        peer_identity: Option<String>,
    ) -> Self {
        let request_id = metadata
            .get(trace_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        RequestLog {
            request_id,
            method,
            accepted: Instant::now(),
            peer_addr,
            peer_identity,
        }
    }

    /// The correlation id for this RPC.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Logs a protocol event for an inbound discovery request. NACKs and
    /// errors log at error level, everything else at debug.
    pub fn proto_event(
        &self,
        req: Option<&DiscoveryRequest>,
        started: Instant,
        msg: &str,
        err: Option<&str>,
    ) {
        let nacked = req.is_some_and(|r| r.error_detail.is_some());
        let level = if err.is_some() || nacked {
            Level::ERROR
        } else {
            Level::DEBUG
        };
        self.emit(level, req, started, msg, err, None);
    }

    /// Logs a sent response (initial, renewal or trust-bundle push) with the
    /// nonce that identifies it.
    pub fn sent(&self, req: Option<&DiscoveryRequest>, started: Instant, msg: &str, nonce: &str) {
        self.emit(Level::INFO, req, started, msg, None, Some(nonce));
    }

    /// Logs the completion record for the RPC; the level follows the status
    /// code.
    pub fn finish(&self, code: tonic::Code) {
        let duration_ms = self.accepted.elapsed().as_millis() as u64;
        let level = level_for(code);
        event_at!(
            level,
            request_id = %self.request_id,
            method = self.method,
            code = ?code,
            duration_ms,
            peer_addr = ?self.peer_addr,
            peer_identity = self.peer_identity.as_deref().unwrap_or(""),
            "finished {} call", self.method
        );
    }

    fn emit(
        &self,
        level: Level,
        req: Option<&DiscoveryRequest>,
        started: Instant,
        msg: &str,
        err: Option<&str>,
        nonce: Option<&str>,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let version_info = req.map(|r| r.version_info.as_str()).unwrap_or("");
        let resource_names = req.map(|r| r.resource_names.join(",")).unwrap_or_default();
        let response_nonce = req.map(|r| r.response_nonce.as_str()).unwrap_or("");
        let node = req
            .and_then(|r| r.node.as_ref())
            .map(|n| n.id.as_str())
            .unwrap_or("");
        let detail = req
            .and_then(|r| r.error_detail.as_ref())
            .map(|s| s.message.as_str())
            .unwrap_or("");
        match (err, nonce) {
            (Some(error), _) => event_at!(
                level,
                request_id = %self.request_id,
                method = self.method,
                duration_ms,
                version_info,
                resource_names = %resource_names,
                response_nonce,
                node,
                error,
                "{msg}"
            ),
            (None, Some(nonce)) => event_at!(
                level,
                request_id = %self.request_id,
                method = self.method,
                duration_ms,
                version_info,
                resource_names = %resource_names,
                response_nonce,
                node,
                nonce,
                "{msg}"
            ),
            (None, None) => event_at!(
                level,
                request_id = %self.request_id,
                method = self.method,
                duration_ms,
                version_info,
                resource_names = %resource_names,
                response_nonce,
                node,
                error_detail = detail,
                "{msg}"
            ),
        }
    }
}
