//! Wire types for the secret discovery service
//!
//! Re-exports the Envoy xDS v3 protobuf and gRPC types the service speaks,
//! so the rest of the crate imports them from one stable path. The upstream
//! bindings are generated from the Envoy API tree; only the discovery,
//! secret and core packages are surfaced here.

pub use envoy_types::pb::envoy::config::core::v3::{
    data_source::Specifier, ControlPlane, DataSource, Node,
};
pub use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, CertificateValidationContext, Secret, TlsCertificate,
};
pub use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
pub use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_client::SecretDiscoveryServiceClient;
pub use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
pub use envoy_types::pb::google::protobuf::Any;
pub use envoy_types::pb::google::rpc::Status as RpcStatus;
