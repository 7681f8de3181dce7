//! End-to-end secret discovery over a real gRPC server
//!
//! Starts the service on a loopback listener and drives it with the
//! generated SDS client: initial subscriptions, acks, nacks, stale nonces,
//! rotation and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Channel, Server};
use tonic::Streaming;

use prost::Message;
use warden_sds::ca::{LocalAuthority, MiniCa};
use warden_sds::config::Config;
use warden_sds::logging::LoggerConfig;
use warden_sds::proto::{
    secret, DiscoveryRequest, DiscoveryResponse, RpcStatus, Secret, SecretDiscoveryServiceClient,
    Specifier,
};
use warden_sds::sds::Service;

type Client = SecretDiscoveryServiceClient<Channel>;

async fn start_server(leaf_validity: Duration) -> (Client, Service) {
    let authority =
        LocalAuthority::new(MiniCa::with_leaf_validity("Stream Test CA", leaf_validity).unwrap());
    let config = Config {
        network: "unix".to_string(),
        address: "unused".to_string(),
        ..Default::default()
    };
    let service = Service::with_authority(&config, &LoggerConfig::default(), Arc::new(authority));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let svc = service.clone().into_service();
    tokio::spawn(async move {
        Server::builder()
            .add_service(svc)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let channel = Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    (SecretDiscoveryServiceClient::new(channel), service)
}

async fn open_stream(
    client: &mut Client,
) -> (mpsc::Sender<DiscoveryRequest>, Streaming<DiscoveryResponse>) {
    let (tx, rx) = mpsc::channel(4);
    let response = client.stream_secrets(ReceiverStream::new(rx)).await.unwrap();
    (tx, response.into_inner())
}

fn request(names: &[&str], version: &str, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        resource_names: names.iter().map(|s| s.to_string()).collect(),
        version_info: version.to_string(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}

async fn next_response(inbound: &mut Streaming<DiscoveryResponse>) -> DiscoveryResponse {
    tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await
        .expect("timed out waiting for a response")
        .expect("stream failed")
        .expect("stream closed")
}

async fn assert_quiet(inbound: &mut Streaming<DiscoveryResponse>, window: Duration) {
    let result = tokio::time::timeout(window, inbound.message()).await;
    assert!(result.is_err(), "expected no response, got {result:?}");
}

fn decode_secret(response: &DiscoveryResponse, index: usize) -> Secret {
    Secret::decode(response.resources[index].value.as_slice()).unwrap()
}

/// Serial of the leaf certificate in a TLS-certificate resource.
fn leaf_serial(response: &DiscoveryResponse, index: usize) -> String {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let secret = decode_secret(response, index);
    let Some(secret::Type::TlsCertificate(tls)) = secret.r#type else {
        panic!("expected a TLS certificate");
    };
    let Some(Specifier::InlineBytes(chain)) = tls.certificate_chain.unwrap().specifier else {
        panic!("expected inline bytes");
    };
    let blocks = pem::parse_many(chain).unwrap();
    assert!(!blocks.is_empty());
    let (_, leaf) = X509Certificate::from_der(blocks[0].contents()).unwrap();
    hex::encode(leaf.raw_serial())
}

#[tokio::test]
async fn initial_subscription_returns_a_certificate() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    let response = next_response(&mut inbound).await;

    assert_eq!(response.resources.len(), 1);
    assert_eq!(response.nonce.len(), 64);
    assert!(response.nonce.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(chrono::DateTime::parse_from_rfc3339(&response.version_info).is_ok());

    let secret = decode_secret(&response, 0);
    assert_eq!(secret.name, "foo.example");
    let serial = leaf_serial(&response, 0);
    assert!(!serial.is_empty());
}

#[tokio::test]
async fn multi_resource_requests_are_answered_in_order() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example", "bar.example", "trusted_ca"], "", ""))
        .await
        .unwrap();
    let response = next_response(&mut inbound).await;

    assert_eq!(response.resources.len(), 3);
    assert_eq!(decode_secret(&response, 0).name, "foo.example");
    assert_eq!(decode_secret(&response, 1).name, "bar.example");
    assert_eq!(decode_secret(&response, 2).name, "trusted_ca");
    assert!(matches!(
        decode_secret(&response, 0).r#type,
        Some(secret::Type::TlsCertificate(_))
    ));
    assert!(matches!(
        decode_secret(&response, 1).r#type,
        Some(secret::Type::TlsCertificate(_))
    ));
    assert!(matches!(
        decode_secret(&response, 2).r#type,
        Some(secret::Type::ValidationContext(_))
    ));
}

#[tokio::test]
async fn ack_quiesces_the_stream_until_renewal() {
    // 3s validity: renewals fire every second
    let (mut client, _service) = start_server(Duration::from_secs(3)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    let initial = next_response(&mut inbound).await;
    let initial_serial = leaf_serial(&initial, 0);

    // ACK: nothing comes back for at least part of the renewal period
    tx.send(request(&["foo.example"], &initial.version_info, &initial.nonce))
        .await
        .unwrap();
    assert_quiet(&mut inbound, Duration::from_millis(400)).await;

    // ... until the renewer rotates the certificate
    let renewed = next_response(&mut inbound).await;
    assert_ne!(leaf_serial(&renewed, 0), initial_serial);
    assert_ne!(renewed.nonce, initial.nonce);
    assert_eq!(decode_secret(&renewed, 0).name, "foo.example");
}

#[tokio::test]
async fn nack_is_logged_and_the_stream_stays_open() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    let initial = next_response(&mut inbound).await;

    // NACK the response; the server takes no action
    let mut nack = request(&["foo.example"], "", &initial.nonce);
    nack.error_detail = Some(RpcStatus {
        code: 13,
        message: "failed to apply".to_string(),
        details: vec![],
    });
    tx.send(nack).await.unwrap();
    assert_quiet(&mut inbound, Duration::from_millis(300)).await;

    // the stream is still usable: a fresh subscription gets an answer
    tx.send(request(&["foo.example"], "", &initial.nonce)).await.unwrap();
    let next = next_response(&mut inbound).await;
    assert_ne!(next.nonce, initial.nonce);
}

#[tokio::test]
async fn stale_nonces_are_ignored() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    let initial = next_response(&mut inbound).await;

    // a request acknowledging a nonce the server never sent is dropped
    tx.send(request(&["foo.example"], "", "feedfacefeedface")).await.unwrap();
    assert_quiet(&mut inbound, Duration::from_millis(300)).await;

    // the right nonce still works afterwards
    tx.send(request(&["foo.example"], "", &initial.nonce)).await.unwrap();
    next_response(&mut inbound).await;
}

#[tokio::test]
async fn nonces_are_unique_across_a_stream() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    let mut nonces = std::collections::HashSet::new();
    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    let mut last = next_response(&mut inbound).await;
    assert!(nonces.insert(last.nonce.clone()));

    for _ in 0..4 {
        // resubscribe with an empty version: answered with a fresh nonce
        tx.send(request(&["foo.example"], "", &last.nonce)).await.unwrap();
        last = next_response(&mut inbound).await;
        assert!(nonces.insert(last.nonce.clone()), "nonce reused");
    }
}

#[tokio::test]
async fn shutdown_ends_streams_cleanly() {
    let (mut client, service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    next_response(&mut inbound).await;

    service.stop();
    let end = tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await
        .expect("timed out waiting for stream end")
        .expect("stream should close without error");
    assert!(end.is_none());
}

#[tokio::test]
async fn client_close_ends_the_stream() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (tx, mut inbound) = open_stream(&mut client).await;

    tx.send(request(&["foo.example"], "", "")).await.unwrap();
    next_response(&mut inbound).await;

    // dropping the sender half closes the request stream
    drop(tx);
    let end = tokio::time::timeout(Duration::from_secs(5), inbound.message())
        .await
        .expect("timed out waiting for stream end")
        .expect("stream should close without error");
    assert!(end.is_none());
}

#[tokio::test]
async fn fetch_returns_fresh_material_per_call() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;

    let a = client
        .fetch_secrets(request(&["foo.example"], "", ""))
        .await
        .unwrap()
        .into_inner();
    let b = client
        .fetch_secrets(request(&["foo.example"], "", ""))
        .await
        .unwrap()
        .into_inner();

    assert_eq!(decode_secret(&a, 0).name, "foo.example");
    assert_ne!(leaf_serial(&a, 0), leaf_serial(&b, 0));
}

#[tokio::test]
async fn delta_secrets_is_unimplemented() {
    let (mut client, _service) = start_server(Duration::from_secs(3600)).await;
    let (_tx, rx) = mpsc::channel::<warden_sds::proto::DeltaDiscoveryRequest>(1);
    let err = client
        .delta_secrets(ReceiverStream::new(rx))
        .await
        .err()
        .expect("delta should be rejected");
    assert_eq!(err.code(), tonic::Code::Unimplemented);
}
