use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use attested_client::cache::{AttestationCache, DocumentFetcher, FetchError};
use attested_client::config::Config;
use attested_client::dialer::AttestedDialer;
use attested_client::policy::PolicyProvider;
use attested_client::transport::EnclaveClient;
use attested_client::{Error, tls};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use shared::verify::certificate_public_key;
use shared::{
    AttestationFailure, DocumentVerifier, MeasurementRegisterSet, RawRegisters, VerifiedDocument,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

const CERT: &[u8] = include_bytes!("data/enclave_cert.der");
const KEY: &[u8] = include_bytes!("data/enclave_key.pk8");
const HOUR: Duration = Duration::from_secs(3600);

const GOOD: &[u8] = b"good";
const STALE: &[u8] = b"stale";
const FORGED: &[u8] = b"forged";
const UNBOUND: &[u8] = b"unbound";

#[derive(Debug, Error)]
#[error("unknown document")]
struct UnknownDocument;

/// Interprets a handful of marker documents instead of real ones.
struct MarkerVerifier {
    spki: Vec<u8>,
}

impl MarkerVerifier {
    fn new() -> Self {
        Self {
            spki: certificate_public_key(CERT).expect("Test failed"),
        }
    }
}

fn registers(fill: u8) -> RawRegisters {
    RawRegisters {
        pcr0: vec![fill; 48],
        pcr1: vec![fill; 48],
        pcr2: vec![fill; 48],
        pcr8: vec![fill; 48],
    }
}

impl DocumentVerifier for MarkerVerifier {
    type Error = UnknownDocument;

    fn verify_document(
        &self,
        doc: &[u8],
        _: Duration,
    ) -> Result<VerifiedDocument, UnknownDocument> {
        let (signature_valid, registers, user_data) = match doc {
            GOOD => (true, registers(1), self.spki.clone()),
            STALE => (true, registers(2), self.spki.clone()),
            FORGED => (false, registers(1), self.spki.clone()),
            UNBOUND => (true, registers(1), b"another key".to_vec()),
            _ => return Err(UnknownDocument),
        };
        Ok(VerifiedDocument {
            signature_valid,
            registers,
            user_data,
        })
    }
}

/// Replays a script of responses, then repeats the last one.
struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<&'static [u8], u16>>>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl ScriptedFetcher {
    fn new(script: impl IntoIterator<Item = Result<&'static [u8], u16>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: Default::default(),
            delay: Duration::ZERO,
        }
    }

    /// Every response takes `delay` to arrive.
    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl DocumentFetcher for ScriptedFetcher {
    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut script = self.script.lock().expect("Test failed");
        let next = if script.len() > 1 {
            script.pop_front().expect("Test failed")
        } else {
            *script.front().expect("Test failed")
        };
        next.map(<[u8]>::to_vec).map_err(FetchError::Status)
    }
}

fn trusted_policy() -> PolicyProvider {
    PolicyProvider::fixed([MeasurementRegisterSet::from(&registers(1))])
}

/// A dialer over a cache fed by `script`, plus the fetch counter.
async fn make_dialer(
    script: impl IntoIterator<Item = Result<&'static [u8], u16>>,
    policy: PolicyProvider,
) -> (AttestedDialer<MarkerVerifier, ScriptedFetcher>, Arc<AtomicUsize>) {
    dialer_over(ScriptedFetcher::new(script), policy).await
}

async fn dialer_over(
    fetcher: ScriptedFetcher,
    policy: PolicyProvider,
) -> (AttestedDialer<MarkerVerifier, ScriptedFetcher>, Arc<AtomicUsize>) {
    let calls = fetcher.calls.clone();
    let cache = AttestationCache::new(fetcher, HOUR).await;
    let dialer = AttestedDialer::new(
        Arc::new(cache),
        Arc::new(policy),
        Arc::new(MarkerVerifier::new()),
        tls::client_config(false).expect("Test failed"),
    );
    (dialer, calls)
}

fn failure(result: Result<(), Error>) -> AttestationFailure {
    let err = result.err().expect("Test failed");
    assert_eq!(err.to_string(), "attestation failed");
    err.attestation_failure().cloned().expect("Test failed")
}

#[tokio::test]
async fn test_trusted_document_needs_no_reload() {
    let (dialer, calls) = make_dialer([Ok(GOOD)], trusted_policy()).await;
    dialer.attest_peer(CERT, None).await.expect("Test failed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_stale_document_is_reloaded_once() {
    let (dialer, calls) = make_dialer([Ok(STALE), Ok(GOOD)], trusted_policy()).await;
    dialer.attest_peer(CERT, None).await.expect("Test failed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(&*dialer.cache().get(), GOOD);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_persistent_mismatch_is_rejected_after_one_reload() {
    let (dialer, calls) = make_dialer([Ok(STALE)], trusted_policy()).await;
    assert_eq!(
        failure(dialer.attest_peer(CERT, None).await),
        AttestationFailure::MeasurementMismatch
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_binding_mismatch_is_reloaded() {
    let (dialer, calls) = make_dialer([Ok(UNBOUND), Ok(GOOD)], trusted_policy()).await;
    dialer.attest_peer(CERT, None).await.expect("Test failed");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    dialer.cache().stop_polling().await;

    let (dialer, _) = make_dialer([Ok(UNBOUND)], trusted_policy()).await;
    assert_eq!(
        failure(dialer.attest_peer(CERT, None).await),
        AttestationFailure::BindingMismatch
    );
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_forged_signature_is_not_reloaded() {
    let (dialer, calls) = make_dialer([Ok(FORGED), Ok(GOOD)], trusted_policy()).await;
    assert_eq!(
        failure(dialer.attest_peer(CERT, None).await),
        AttestationFailure::UnverifiedSignature
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    dialer.cache().stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_cache_is_reloaded() {
    let script = [Err(503), Err(503), Err(503), Ok(GOOD)];
    let (dialer, calls) = make_dialer(script, trusted_policy()).await;
    assert!(dialer.cache().get().is_empty());
    dialer.attest_peer(CERT, None).await.expect("Test failed");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    dialer.cache().stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_reload_is_rejected() {
    let (dialer, calls) = make_dialer([Ok(STALE), Err(500)], trusted_policy()).await;
    assert_eq!(
        failure(dialer.attest_peer(CERT, None).await),
        AttestationFailure::MeasurementMismatch
    );
    // every retry of the single reload
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(&*dialer.cache().get(), STALE);
    dialer.cache().stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_respects_caller_deadline() {
    let (dialer, calls) = make_dialer([Ok(STALE), Err(500)], trusted_policy()).await;
    let start = Instant::now();
    let deadline = start + Duration::from_millis(500);
    assert_eq!(
        failure(dialer.attest_peer(CERT, Some(deadline)).await),
        AttestationFailure::MeasurementMismatch
    );
    // the first retry would overshoot the deadline
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(start.elapsed(), Duration::ZERO);
    dialer.cache().stop_polling().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_share_one_reload() {
    let fetcher = ScriptedFetcher::new([Ok(STALE), Ok(GOOD)]).with_delay(Duration::from_secs(1));
    let (dialer, calls) = dialer_over(fetcher, trusted_policy()).await;
    let (a, b, c) = tokio::join!(
        dialer.attest_peer(CERT, None),
        dialer.attest_peer(CERT, None),
        dialer.attest_peer(CERT, None),
    );
    a.expect("Test failed");
    b.expect("Test failed");
    c.expect("Test failed");
    // the initial load and a single reload
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_empty_policy_fails_before_connecting() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
    let address = listener.local_addr().expect("Test failed").to_string();
    let empty = PolicyProvider::fixed([MeasurementRegisterSet::default()]);
    let (dialer, calls) = make_dialer([Ok(GOOD)], empty).await;

    assert!(matches!(
        dialer.dial("tcp", &address).await,
        Err(Error::NoPolicy)
    ));
    assert!(matches!(
        dialer.attest_peer(CERT, None).await,
        Err(Error::NoPolicy)
    ));
    // nothing connected and no document was requested
    assert!(
        tokio::time::timeout(Duration::from_millis(100), listener.accept())
            .await
            .is_err()
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_client_without_policy_is_refused() {
    let config = Config {
        enclave_host: "enclave.invalid".to_string(),
        ..Default::default()
    };
    let err = EnclaveClient::with_static_policy(&config, MarkerVerifier::new(), [])
        .await
        .err()
        .expect("Test failed");
    assert!(matches!(err, Error::NoPolicy));

    let err = EnclaveClient::with_policy_source(&config, MarkerVerifier::new(), || {
        Ok(vec![MeasurementRegisterSet::default()])
    })
    .await
    .err()
    .expect("Test failed");
    assert!(matches!(err, Error::NoPolicy));
}

#[tokio::test]
async fn test_only_tcp_is_supported() {
    let (dialer, _) = make_dialer([Ok(GOOD)], trusted_policy()).await;
    assert!(matches!(
        dialer.dial("udp", "127.0.0.1:443").await,
        Err(Error::UnsupportedNetwork(_))
    ));
    dialer.cache().stop_polling().await;
}

/// Serves `ok` to every HTTP/1.1 request, keeping connections open.
async fn serve(mut stream: tokio_rustls::server::TlsStream<TcpStream>) {
    const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);
        while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
            pending.drain(..end + 4);
            if stream.write_all(RESPONSE).await.is_err() {
                return;
            }
        }
    }
}

/// A TLS endpoint presenting the fixture certificate. Returns its
/// address and a count of accepted connections.
async fn spawn_enclave() -> (SocketAddr, Arc<AtomicUsize>) {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(KEY.to_vec())),
        )
        .expect("Test failed");
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
    let address = listener.local_addr().expect("Test failed");
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = accepted.clone();
        async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(stream) = acceptor.accept(tcp).await {
                        serve(stream).await;
                    }
                });
            }
        }
    });
    (address, accepted)
}

#[tokio::test]
async fn test_dial_returns_attested_stream() {
    let (address, accepted) = spawn_enclave().await;
    let (dialer, _) = make_dialer([Ok(GOOD)], trusted_policy()).await;
    let stream = dialer
        .dial("tcp", &address.to_string())
        .await
        .expect("Test failed");
    let leaf = stream.get_ref().1.peer_certificates().expect("Test failed")[0].clone();
    assert_eq!(leaf.as_ref(), CERT);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_dial_rejects_untrusted_enclave() {
    let (address, _) = spawn_enclave().await;
    let (dialer, calls) = make_dialer([Ok(STALE)], trusted_policy()).await;
    let err = dialer
        .dial_with_deadline(
            "tcp",
            &address.to_string(),
            Instant::now() + Duration::from_secs(10),
        )
        .await
        .err()
        .expect("Test failed");
    assert_eq!(err.to_string(), "attestation failed");
    assert_eq!(
        err.attestation_failure(),
        Some(&AttestationFailure::MeasurementMismatch)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_dial_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
    let address = listener.local_addr().expect("Test failed").to_string();
    drop(listener);
    let (dialer, _) = make_dialer([Ok(GOOD)], trusted_policy()).await;
    assert!(matches!(
        dialer.dial("tcp", &address).await,
        Err(Error::Connect(_))
    ));
    dialer.cache().stop_polling().await;
}

#[tokio::test]
async fn test_silent_peer_handshake_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Test failed");
    let address = listener.local_addr().expect("Test failed").to_string();
    // accepts the connection and never says anything
    let peer = tokio::spawn(async move {
        let (_tcp, _) = listener.accept().await.expect("Test failed");
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    let (dialer, _) = make_dialer([Ok(GOOD)], trusted_policy()).await;
    let dialer = dialer
        .with_connect_timeout(Duration::from_secs(1))
        .with_handshake_timeout(Duration::from_millis(200));

    let start = std::time::Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(10), dialer.dial("tcp", &address))
        .await
        .expect("Test failed")
        .err()
        .expect("Test failed");
    assert!(matches!(&err, Error::Tls(e) if e.kind() == ErrorKind::TimedOut));
    assert!(start.elapsed() < Duration::from_secs(5));
    peer.abort();
    dialer.cache().stop_polling().await;
}

fn local_config(address: SocketAddr) -> Config {
    Config {
        enclave_host: address.to_string(),
        verify_certificate_chain: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_http_requests_use_fresh_connections() {
    let (address, accepted) = spawn_enclave().await;
    let cache = AttestationCache::new(ScriptedFetcher::new([Ok(GOOD)]), HOUR).await;
    let client = EnclaveClient::from_parts(
        &local_config(address),
        cache,
        trusted_policy(),
        MarkerVerifier::new(),
    )
    .expect("Test failed");

    let response = client.get("/health").await.expect("Test failed");
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"ok");

    let response = client
        .post_json("status", &serde_json::json!({"verbose": true}))
        .await
        .expect("Test failed");
    assert_eq!(response.status(), http::StatusCode::OK);

    // no connection is ever reused
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    client.shutdown().await;
}

#[tokio::test]
async fn test_http_request_to_untrusted_enclave() {
    let (address, _) = spawn_enclave().await;
    let cache = AttestationCache::new(ScriptedFetcher::new([Ok(FORGED)]), HOUR).await;
    let client = EnclaveClient::from_parts(
        &local_config(address),
        cache,
        trusted_policy(),
        MarkerVerifier::new(),
    )
    .expect("Test failed");

    let err = client.get("/health").await.err().expect("Test failed");
    assert_eq!(err.to_string(), "attestation failed");
    assert_eq!(
        err.attestation_failure(),
        Some(&AttestationFailure::UnverifiedSignature)
    );
    client.shutdown().await;
}
