//! Async https client pinned to the bootstrap poller's published address.

use core::time::Duration;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Mutex,
};

use tokio::sync::watch;
use tracing::debug;

use crate::{config::Config, error::Error, util::BoxFuture};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Seam between dispatch and the http transport so the server loop can be
/// exercised against a mock upstream.
///
/// Every failure category, connect, tls, timeout, non-2xx status, collapses
/// into `Err`: the caller treats all of them as "no usable answer" and
/// drops the query without replying.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: String) -> BoxFuture<'_, Result<Vec<u8>, Error>>;
}

pub struct HttpsClient {
    host: String,
    port: u16,
    proxy: Option<String>,
    http1_only: bool,
    pin: watch::Receiver<Option<IpAddr>>,
    // One pooled client per pin value, rebuilt only when the pin moves. A
    // fetch in flight keeps the client it was issued with, so a pin change
    // never redirects it mid-flight.
    cli: Mutex<Option<(IpAddr, reqwest::Client)>>,
}

impl HttpsClient {
    pub fn new(cfg: &Config, pin: watch::Receiver<Option<IpAddr>>) -> Self {
        Self {
            host: cfg.upstream.host.clone(),
            port: cfg.upstream.port,
            proxy: cfg.proxy.clone(),
            http1_only: cfg.http1_only,
            pin,
            cli: Mutex::new(None),
        }
    }

    fn client_for_current_pin(&self) -> Result<reqwest::Client, Error> {
        let pinned = *self.pin.borrow();
        let Some(addr) = pinned else {
            // Fail fast rather than wait on a resolution in flight.
            return Err(Error::NoPinnedAddr);
        };

        let mut cached = self.cli.lock().unwrap();

        if let Some((cached_addr, cli)) = cached.as_ref() {
            if *cached_addr == addr {
                return Ok(cli.clone());
            }
        }

        let cli = self.build(addr)?;
        *cached = Some((addr, cli.clone()));

        Ok(cli)
    }

    fn build(&self, addr: IpAddr) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .resolve(&self.host, SocketAddr::new(addr, self.port))
            .timeout(FETCH_TIMEOUT)
            .use_rustls_tls();

        builder = match self.proxy.as_deref() {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };

        if self.http1_only {
            builder = builder.http1_only();
        }

        builder.build().map_err(Error::from)
    }
}

impl Fetch for HttpsClient {
    fn fetch(&self, url: String) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        Box::pin(async move {
            let cli = self.client_for_current_pin()?;

            let res = cli.get(&url).send().await?;

            debug!("upstream fetch outcome. status: {:?}", res.status());

            if !res.status().is_success() {
                return Err(Error::Status(res.status().as_u16()));
            }

            let body = res.bytes().await?;

            Ok(body.to_vec())
        })
    }
}
