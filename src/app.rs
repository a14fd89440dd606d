//! Udp server loop, per query correlation and dispatch to the upstream.

use std::{io, net::SocketAddr, sync::Arc};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

use crate::{config::Config, dns, error::Error, https::Fetch, payload::Format};

// Escape set for the name component of the upstream query string.
const NAME_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?');

pub struct App {
    listener: UdpSocket,
    fetch: Box<dyn Fetch>,
    format: Format,
    base_url: String,
    // Pre-rendered `&ip=<subnet>` suffix, empty when not configured.
    subnet_suffix: String,
}

/// Per query context: transaction id, return address and queried name.
///
/// Created on query receipt, moved into the dispatch task and consumed
/// exactly once on every terminal path, answered or dropped. No table of
/// in-flight requests exists; the task owns its context.
struct Request {
    id: u16,
    addr: SocketAddr,
    name: String,
}

impl App {
    pub async fn bind(cfg: &Config, fetch: Box<dyn Fetch>) -> Result<Arc<Self>, Error> {
        let listener = UdpSocket::bind((cfg.listen_addr, cfg.listen_port)).await?;

        info!("listening on {}", listener.local_addr()?);

        let subnet_suffix = if cfg.edns_client_subnet.is_empty() {
            String::new()
        } else {
            format!("&ip={}", cfg.edns_client_subnet)
        };

        Ok(Arc::new(Self {
            listener,
            fetch,
            format: cfg.format,
            base_url: cfg.upstream.base_url.clone(),
            subnet_suffix,
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(Error::from)
    }

    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let mut buf = [0; dns::MAX_QUERY_LEN];

        loop {
            match self.listener.recv_from(&mut buf).await {
                Ok((len, addr)) => Arc::clone(&self).accept(&mut buf[..len], addr),
                Err(ref e) if connection_error(e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn accept(self: Arc<Self>, datagram: &mut [u8], addr: SocketAddr) {
        let query = match dns::decode_query(datagram) {
            Ok(query) => query,
            Err(e) => {
                debug!("dropping malformed datagram from {addr}: {e}");
                return;
            }
        };

        debug!(
            "received query for '{}' id: {:04x}, type {}, cd {}",
            query.name, query.id, query.qtype, query.checking_disabled
        );

        // Unsupported queries are refused before any per request state
        // exists. No error reply either way: the client times out and
        // retries, indistinguishable from packet loss. Oversized names
        // never get this far, decode_query already rejects them.
        if query.qtype != dns::QTYPE_A || query.qclass != dns::CLASS_IN {
            debug!(
                "dropping unsupported query for '{}' id: {:04x}, type {}",
                query.name, query.id, query.qtype
            );
            return;
        }

        let url = self.request_url(&query.name);
        let req = Request {
            id: query.id,
            addr,
            name: query.name,
        };

        tokio::spawn(async move { self.dispatch(req, url).await });
    }

    fn request_url(&self, name: &str) -> String {
        let escaped = utf8_percent_encode(name, NAME_ESCAPE);
        format!(
            "{}?{}={}{}",
            self.base_url,
            self.format.name_param(),
            escaped,
            self.subnet_suffix
        )
    }

    async fn dispatch(&self, req: Request, url: String) {
        let body = match self.fetch.fetch(url).await {
            Ok(body) => body,
            Err(e) => {
                error!("upstream fetch failed for id {:04x}: {e}", req.id);
                return;
            }
        };

        let records = match self.format.decode(&body, &req.name) {
            Ok(records) => records,
            Err(e) => {
                error!("dropping response for id {:04x}: {e}", req.id);
                return;
            }
        };

        let reply = match dns::encode_answer(req.id, &req.name, &records) {
            Ok(reply) => reply,
            Err(e) => {
                error!("dropping response for id {:04x}: {e}", req.id);
                return;
            }
        };

        // The only reply path, used at most once per query.
        if let Err(e) = self.listener.send_to(&reply, req.addr).await {
            error!("failed sending reply to {}: {e}", req.addr);
        }
    }
}

fn connection_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
        || e.kind() == io::ErrorKind::ConnectionAborted
        || e.kind() == io::ErrorKind::ConnectionReset
}
