//! An HTTP client whose every connection goes through the attested
//! dialer. Connections are never pooled, so each request is made over
//! a freshly attested channel.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response, Uri, header};
use http_body_util::{BodyExt, Full};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use shared::{DocumentVerifier, MeasurementRegisterSet};
use tower_service::Service;

use crate::cache::{AttestationCache, DocumentFetcher, HttpDocumentFetcher};
use crate::config::Config;
use crate::dialer::{AttestedDialer, AttestedStream};
use crate::error::{Error, Result};
use crate::policy::{PolicyProvider, PolicySource};
use crate::tls;

const HTTPS_PORT: u16 = 443;

/// An attested connection as seen by hyper.
pub struct AttestedConnection(TokioIo<AttestedStream>);

impl AttestedConnection {
    pub fn into_inner(self) -> AttestedStream {
        self.0.into_inner()
    }
}

impl Read for AttestedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl Write for AttestedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl Connection for AttestedConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector plugging the attested dialer into hyper's client.
pub struct AttestedConnector<V, F: DocumentFetcher = HttpDocumentFetcher> {
    dialer: AttestedDialer<V, F>,
}

impl<V, F: DocumentFetcher> AttestedConnector<V, F> {
    pub fn new(dialer: AttestedDialer<V, F>) -> Self {
        Self { dialer }
    }
}

impl<V, F: DocumentFetcher> Clone for AttestedConnector<V, F> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
        }
    }
}

impl<V, F> Service<Uri> for AttestedConnector<V, F>
where
    V: DocumentVerifier + Send + Sync + 'static,
    F: DocumentFetcher,
{
    type Response = AttestedConnection;
    type Error = Error;
    type Future = BoxFuture<'static, Result<AttestedConnection>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            let address = dial_address(&uri)?;
            let stream = dialer.dial("tcp", &address).await?;
            Ok(AttestedConnection(TokioIo::new(stream)))
        })
    }
}

/// `host:port` for a URI, defaulting to the HTTPS port.
pub fn dial_address(uri: &Uri) -> Result<String> {
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidAddress(uri.to_string()))?;
    Ok(format!("{host}:{}", uri.port_u16().unwrap_or(HTTPS_PORT)))
}

/// Recover our own error from the chain hyper wrapped it in.
fn request_error(e: hyper_util::client::legacy::Error) -> Error {
    let mut source = std::error::Error::source(&e);
    while let Some(err) = source {
        match err.downcast_ref::<Error>() {
            Some(Error::AttestationFailed(failure)) => {
                return Error::AttestationFailed(failure.clone());
            }
            Some(Error::NoPolicy) => return Error::NoPolicy,
            Some(other) => return Error::Http(other.to_string()),
            None => source = std::error::Error::source(err),
        }
    }
    Error::Http(e.to_string())
}

/// HTTP client for a single enclave.
pub struct EnclaveClient<V, F: DocumentFetcher = HttpDocumentFetcher> {
    base_url: String,
    client: Client<AttestedConnector<V, F>, Full<Bytes>>,
    dialer: AttestedDialer<V, F>,
}

impl<V> EnclaveClient<V>
where
    V: DocumentVerifier + Send + Sync + 'static,
{
    /// A client trusting the given register sets. Fails if none of
    /// them specifies any register.
    pub async fn with_static_policy(
        config: &Config,
        verifier: V,
        sets: impl IntoIterator<Item = MeasurementRegisterSet>,
    ) -> Result<Self> {
        let policy = PolicyProvider::fixed(sets);
        if policy.get().is_empty() {
            return Err(Error::NoPolicy);
        }
        Self::with_provider(config, verifier, policy).await
    }

    /// A client whose trusted register sets are refreshed from
    /// `source`. Fails if the first fetch yields no usable policy.
    pub async fn with_policy_source<S: PolicySource>(
        config: &Config,
        verifier: V,
        source: S,
    ) -> Result<Self> {
        let policy = PolicyProvider::polling(config.policy_polling_interval, source).await;
        if policy.get().is_empty() {
            policy.stop_polling().await;
            return Err(Error::NoPolicy);
        }
        Self::with_provider(config, verifier, policy).await
    }

    async fn with_provider(config: &Config, verifier: V, policy: PolicyProvider) -> Result<Self> {
        let fetcher = HttpDocumentFetcher::new(&config.enclave_host)?;
        let cache = AttestationCache::new(fetcher, config.attestation_polling_interval).await;
        Self::from_parts(config, cache, policy, verifier)
    }
}

impl<V, F> EnclaveClient<V, F>
where
    V: DocumentVerifier + Send + Sync + 'static,
    F: DocumentFetcher,
{
    /// Assemble a client from an existing cache and policy provider.
    pub fn from_parts(
        config: &Config,
        cache: AttestationCache<F>,
        policy: PolicyProvider,
        verifier: V,
    ) -> Result<Self> {
        let tls = tls::client_config(config.verify_certificate_chain)?;
        let dialer = AttestedDialer::new(
            Arc::new(cache),
            Arc::new(policy),
            Arc::new(verifier),
            tls,
        )
        .with_connect_timeout(config.connect_timeout);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(AttestedConnector::new(dialer.clone()));
        Ok(Self {
            base_url: format!("https://{}", config.enclave_host),
            client,
            dialer,
        })
    }

    /// The dialer behind this client, for protocols other than HTTP.
    pub fn dialer(&self) -> &AttestedDialer<V, F> {
        &self.dialer
    }

    /// Send a request and collect the whole response body.
    pub async fn request(&self, req: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let response = self.client.request(req).await.map_err(request_error)?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }

    pub async fn get(&self, path: &str) -> Result<Response<Bytes>> {
        let req = Request::get(self.url(path)?)
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::Http(e.to_string()))?;
        self.request(req).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response<Bytes>> {
        let body = serde_json::to_vec(body).map_err(|e| Error::Http(e.to_string()))?;
        let req = Request::post(self.url(path)?)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Http(e.to_string()))?;
        self.request(req).await
    }

    fn url(&self, path: &str) -> Result<Uri> {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/{path}", self.base_url)
            .parse()
            .map_err(|e: http::uri::InvalidUri| Error::Http(e.to_string()))
    }

    /// Stop refreshing the attestation document and the policy.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down the enclave client...");
        self.dialer.cache().stop_polling().await;
        self.dialer.policy().stop_polling().await;
    }
}
