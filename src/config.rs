/// Argument parsing.
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

use bpaf::{construct, short, Parser};
use tracing::Level;
use url::{Host, Url};

use crate::{error::Error, payload::Format};

const DEFAULT_UPSTREAM: &str = "http://119.29.29.29/d";
const DEFAULT_BOOTSTRAP: &str = "8.8.8.8,8.8.4.4,1.1.1.1";

/// Immutable configuration snapshot. Built once before the runtime starts,
/// read only for the lifetime of the process.
#[derive(Debug)]
pub struct Config {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    pub edns_client_subnet: String,
    pub bootstrap_dns: Vec<SocketAddr>,
    pub upstream: Upstream,
    pub format: Format,
    pub daemonize: bool,
    pub user: String,
    pub group: String,
    pub proxy: Option<String>,
    pub logfile: String,
    pub log_level: Level,
    pub http1_only: bool,
}

/// The DoH endpoint, split so the https client can pin its hostname to the
/// bootstrap poller's address without re-parsing the url per fetch.
#[derive(Clone, Debug)]
pub struct Upstream {
    /// `scheme://host[:port]/path`, no query string.
    pub base_url: String,
    pub host: String,
    /// Set when the host is an ip literal (v4 or v6), which needs no
    /// bootstrap resolution at all.
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl FromStr for Upstream {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s.trim()).map_err(|e| Error::Upstream(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(Error::Upstream(format!("unsupported scheme: {other}"))),
        }

        if url.query().is_some() {
            return Err(Error::Upstream(
                "query string is appended per request, leave it off the upstream url".into(),
            ));
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::Upstream("missing host".into()))?
            .to_string();

        // host_str keeps the brackets around a v6 literal, so the literal
        // check has to go through the typed host instead of string parsing.
        let addr = match url.host() {
            Some(Host::Ipv4(v4)) => Some(IpAddr::V4(v4)),
            Some(Host::Ipv6(v6)) => Some(IpAddr::V6(v6)),
            _ => None,
        };

        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Upstream("missing port".into()))?;

        Ok(Self {
            base_url: url.to_string(),
            host,
            addr,
            port,
        })
    }
}

fn parse_bootstrap(arg: String) -> Result<Vec<SocketAddr>, Error> {
    let mut servers = Vec::new();

    for entry in arg.split(',') {
        // IP literals only. A hostname here would have to be resolved
        // through the system resolver, the exact loop bootstrapping avoids.
        let ip = entry
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| Error::Upstream(format!("bootstrap server is not an ip literal: {entry}")))?;
        servers.push(SocketAddr::new(ip, 53));
    }

    Ok(servers)
}

const fn verbosity_level(count: usize) -> Level {
    match count {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

#[cold]
#[inline(never)]
pub fn parse_args() -> Config {
    let listen_addr = short('a')
        .long("listen-addr")
        .help("Local address to bind to")
        .argument("ADDR")
        .parse(|addr: String| addr.parse::<IpAddr>())
        .fallback(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    let listen_port = short('p')
        .long("listen-port")
        .help("Local port to bind to")
        .argument("PORT")
        .parse(|port: String| port.parse::<u16>())
        .fallback(5353);

    let edns_client_subnet = short('e')
        .long("subnet")
        .help("An edns-client-subnet to forward upstream, such as \"203.31.0.0/16\"")
        .argument("SUBNET")
        .fallback(String::new());

    let bootstrap_dns = short('b')
        .long("bootstrap")
        .help("Comma separated bootstrap dns server ip literals used to resolve the upstream host")
        .argument("BOOTSTRAP")
        .parse(parse_bootstrap)
        .fallback(parse_bootstrap(DEFAULT_BOOTSTRAP.to_string()).unwrap());

    let upstream = short('r')
        .long("upstream")
        .help("Upstream DoH endpoint url, scheme://host[:port]/path")
        .argument("URL")
        .parse(|url: String| url.parse::<Upstream>())
        .fallback(DEFAULT_UPSTREAM.parse().unwrap());

    let format = short('F')
        .long("format")
        .help("Upstream payload format: text or json")
        .argument("FORMAT")
        .parse(|fmt: String| fmt.parse::<Format>())
        .fallback(Format::Text);

    let daemonize = short('d')
        .long("daemonize")
        .help("Fork to background after dropping privileges")
        .switch();

    let user = short('u')
        .long("user")
        .help("User to drop to when daemonizing")
        .argument("USER")
        .fallback("nobody".to_string());

    let group = short('g')
        .long("group")
        .help("Group to drop to when daemonizing")
        .argument("GROUP")
        .fallback("nobody".to_string());

    let proxy = short('t')
        .long("proxy")
        .help("Optional proxy for upstream fetches, e.g. socks5://127.0.0.1:1080")
        .argument("PROXY")
        .optional();

    let logfile = short('l')
        .long("logfile")
        .help("Path of file to log to, \"-\" for stdout")
        .argument("LOGFILE")
        .fallback("-".to_string());

    let log_level = short('v')
        .long("verbose")
        .help("Increase logging verbosity, repeatable")
        .req_flag(())
        .many()
        .map(|flags| verbosity_level(flags.len()));

    let http1_only = short('x')
        .long("http1")
        .help("Use HTTP/1.1 instead of HTTP/2 toward the upstream")
        .switch();

    construct!(Config {
        listen_addr,
        listen_port,
        edns_client_subnet,
        bootstrap_dns,
        upstream,
        format,
        daemonize,
        user,
        group,
        proxy,
        logfile,
        log_level,
        http1_only
    })
    .to_options()
    .descr("UDP DNS to DNS-over-HTTPS gateway")
    .run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_url_parsing() {
        let upstream: Upstream = DEFAULT_UPSTREAM.parse().unwrap();
        assert_eq!(upstream.host, "119.29.29.29");
        assert_eq!(upstream.port, 80);
        assert_eq!(upstream.base_url, "http://119.29.29.29/d");

        let upstream: Upstream = "https://dns.google/resolve".parse().unwrap();
        assert_eq!(upstream.host, "dns.google");
        assert_eq!(upstream.port, 443);

        let upstream: Upstream = "https://dns.example:8443/q".parse().unwrap();
        assert_eq!(upstream.port, 8443);
    }

    #[test]
    fn ip_literal_upstream_is_recognized() {
        let upstream: Upstream = DEFAULT_UPSTREAM.parse().unwrap();
        assert_eq!(upstream.addr, Some("119.29.29.29".parse().unwrap()));

        // A v6 host arrives bracketed from the url parser and must still
        // count as a literal, or bootstrap resolution would be spawned
        // against a name no dns server knows.
        let upstream: Upstream = "http://[2001:db8::1]/d".parse().unwrap();
        assert_eq!(upstream.host, "[2001:db8::1]");
        assert_eq!(upstream.addr, Some("2001:db8::1".parse().unwrap()));

        let upstream: Upstream = "https://dns.google/resolve".parse().unwrap();
        assert_eq!(upstream.addr, None);
    }

    #[test]
    fn upstream_url_rejects_bad_input() {
        assert!("ftp://dns.example/q".parse::<Upstream>().is_err());
        assert!("https://dns.example/q?name=fixed".parse::<Upstream>().is_err());
        assert!("not a url".parse::<Upstream>().is_err());
    }

    #[test]
    fn bootstrap_servers_must_be_ip_literals() {
        let servers = parse_bootstrap(DEFAULT_BOOTSTRAP.to_string()).unwrap();
        assert_eq!(servers.len(), 3);
        assert!(servers.iter().all(|s| s.port() == 53));

        assert!(parse_bootstrap("dns.google".to_string()).is_err());
    }

    #[test]
    fn verbosity_steps_down_from_error() {
        assert_eq!(verbosity_level(0), Level::ERROR);
        assert_eq!(verbosity_level(1), Level::WARN);
        assert_eq!(verbosity_level(2), Level::INFO);
        assert_eq!(verbosity_level(3), Level::DEBUG);
        assert_eq!(verbosity_level(9), Level::TRACE);
    }
}
