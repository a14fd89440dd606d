//! Bootstrap resolution of the DoH endpoint's own hostname.
//!
//! The upstream host can not be resolved through the system resolver when
//! this proxy is the system resolver, so it is looked up against an
//! explicit list of bootstrap dns server ip literals, over a one-shot udp
//! socket speaking this crate's own codec. The result is published through
//! a watch channel the https client reads at fetch-issue time.

use core::time::Duration;

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::{net::UdpSocket, sync::watch, task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{dns, error::Error};

pub const POLL_INTERVAL: Duration = Duration::from_secs(120);

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle of the periodic refresh task. Dropping it stops the refresh.
pub struct Poller {
    handle: JoinHandle<()>,
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Starts periodic resolution of `hostname`, first tick immediately.
///
/// The receiver holds `None` until the first successful resolution; a
/// failed tick keeps the previous pin in place, stale beats empty.
pub fn spawn(
    hostname: String,
    bootstrap: Vec<SocketAddr>,
) -> (Poller, watch::Receiver<Option<IpAddr>>) {
    let (tx, rx) = watch::channel(None);

    let handle = tokio::spawn(async move {
        let mut interval = time::interval(POLL_INTERVAL);

        loop {
            interval.tick().await;

            match resolve(&bootstrap, &hostname).await {
                Ok(addr) => {
                    let prev = tx.send_replace(Some(addr));
                    if prev != Some(addr) {
                        info!("pinned upstream address for {hostname}: {addr}");
                    }
                }
                Err(e) => warn!("bootstrap resolution of {hostname} failed: {e}"),
            }
        }
    });

    (Poller { handle }, rx)
}

async fn resolve(bootstrap: &[SocketAddr], hostname: &str) -> Result<IpAddr, Error> {
    let mut err = None;

    for server in bootstrap {
        match lookup(*server, hostname).await {
            Ok(addr) => return Ok(addr),
            Err(e) => {
                debug!("bootstrap server {server} failed for {hostname}: {e}");
                err = Some(e);
            }
        }
    }

    Err(err.unwrap_or_else(|| Error::Upstream("no bootstrap servers configured".into())))
}

async fn lookup(server: SocketAddr, hostname: &str) -> Result<IpAddr, Error> {
    let id = transaction_id();
    let query = dns::encode_lookup(id, hostname)?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    socket.send(&query).await?;

    let mut buf = [0; dns::MAX_QUERY_LEN];
    let len = time::timeout(LOOKUP_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "bootstrap lookup timed out"))??;

    let records = dns::decode_lookup_answer(&mut buf[..len], id)?;

    records
        .first()
        .map(|record| record.addr)
        .ok_or(Error::Malformed("lookup answer carried no address records"))
}

// Correlates the one-shot lookup with its reply. The reply is already
// scoped to a connected ephemeral socket, so sub-second entropy is plenty.
fn transaction_id() -> u16 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.subsec_nanos() as u16)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // One answer then exit, standing in for a bootstrap dns server.
    async fn fake_bootstrap_server(addr: IpAddr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0; dns::MAX_QUERY_LEN];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();

            let query = dns::decode_query(&mut buf[..len]).unwrap();
            let reply = dns::encode_answer(
                query.id,
                &query.name,
                &[dns::Record { addr, ttl: 300 }],
            )
            .unwrap();

            socket.send_to(&reply, peer).await.unwrap();
        });

        local
    }

    #[tokio::test]
    async fn lookup_against_bootstrap_server() {
        let pinned: IpAddr = "192.0.2.53".parse().unwrap();
        let server = fake_bootstrap_server(pinned).await;

        let addr = lookup(server, "doh.example").await.unwrap();
        assert_eq!(addr, pinned);
    }

    #[tokio::test]
    async fn poller_publishes_pin() {
        let pinned: IpAddr = "192.0.2.53".parse().unwrap();
        let server = fake_bootstrap_server(pinned).await;

        let (_poller, mut rx) = spawn("doh.example".to_string(), vec![server]);

        time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("poller never published")
            .unwrap();

        assert_eq!(*rx.borrow(), Some(pinned));
    }

    #[tokio::test]
    async fn garbage_reply_is_an_error() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0; dns::MAX_QUERY_LEN];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(b"not dns", peer).await.unwrap();
        });

        assert!(lookup(server, "doh.example").await.is_err());
    }
}
