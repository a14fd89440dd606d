mod app;
mod config;
#[cfg(unix)]
mod daemon;
mod dns;
mod error;
mod https;
mod payload;
mod resolver;
mod util;

use tokio::sync::watch;
use tracing::{error, info};

use self::{app::App, config::Config, error::Error, https::HttpsClient};

fn main() {
    let cfg = config::parse_args();

    if let Err(e) = init_logging(&cfg) {
        eprintln!("logfile '{}' is not writable: {e}", cfg.logfile);
        std::process::exit(1);
    }

    #[cfg(unix)]
    if cfg.daemonize {
        // Bad credentials are fatal before any socket work happens.
        let res = daemon::Credentials::lookup(&cfg.user, &cfg.group)
            .and_then(|creds| creds.drop_privileges())
            .and_then(|_| daemon::daemonize());
        if let Err(e) = res {
            error!("fatal error: {e}");
            std::process::exit(1);
        }
    }

    #[cfg(not(unix))]
    if cfg.daemonize {
        error!("daemonizing is not supported on this platform");
        std::process::exit(1);
    }

    if let Err(e) = run(cfg) {
        error!("fatal error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(cfg: &Config) -> std::io::Result<()> {
    if cfg.logfile == "-" {
        tracing_subscriber::fmt()
            .with_max_level(cfg.log_level)
            .init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.logfile)?;
        tracing_subscriber::fmt()
            .with_max_level(cfg.log_level)
            .with_writer(std::sync::Arc::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}

fn run(cfg: Config) -> Result<(), Error> {
    info!("starting doh-proxy with configuration: {:?}", cfg);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(serve(cfg))
}

async fn serve(cfg: Config) -> Result<(), Error> {
    // An ip literal upstream host needs no bootstrap resolution and gets a
    // constant pin. A hostname is refreshed continuously from startup.
    let (pin, _poller) = match cfg.upstream.addr {
        Some(addr) => {
            info!("upstream host is an ip literal, skipping bootstrap resolution");
            let (_tx, rx) = watch::channel(Some(addr));
            (rx, None)
        }
        None => {
            let (poller, rx) =
                resolver::spawn(cfg.upstream.host.clone(), cfg.bootstrap_dns.clone());
            (rx, Some(poller))
        }
    };

    let client = HttpsClient::new(&cfg, pin);
    let app = App::bind(&cfg, Box::new(client)).await?;

    tokio::select! {
        res = app.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            Ok(())
        }
        _ = terminate() => {
            info!("received termination signal, shutting down");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("failed to register SIGTERM handler: {e}");
            core::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    core::future::pending::<()>().await
}
