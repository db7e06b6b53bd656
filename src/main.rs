use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader};

use evote_terminals::auth::UrnContact;
use evote_terminals::collab::{LogPresenter, MemoryStore, Presenter};
use evote_terminals::config::Config;
use evote_terminals::crypto::KeyPair;
use evote_terminals::error::Error;
use evote_terminals::logging::LIVENESS_FILTER;
use evote_terminals::model::TerminalKind;
use evote_terminals::net::{Network, TcpNetwork};
use evote_terminals::terminal::{Post, Station, SubStation, Terminal, TerminalRunner, Urn};

/// Run one terminal of the voting network.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file; `EVOTE_*` variables override it.
    #[arg(long, default_value = "Terminal.toml")]
    config: PathBuf,
    /// Run as this kind of terminal, whatever the configuration says.
    #[arg(long)]
    kind: Option<TerminalKind>,
    /// Keep logging every liveness check.
    #[arg(long)]
    verbose: bool,
}

async fn run(cli: Cli) -> Result<(), Error> {
    info!("Loading configuration from {}...", cli.config.display());
    let config = Config::load(&cli.config, cli.kind)?;
    let network: Arc<dyn Network> = match config.tls() {
        Some(tls) => Arc::new(TcpNetwork::with_tls(config.io_timeout(), tls)?),
        None => {
            warn!("No TLS configured, links are not encrypted");
            Arc::new(TcpNetwork::plain(config.io_timeout()))
        }
    };
    let presenter: Arc<dyn Presenter> = Arc::new(LogPresenter);
    let settings = config.runner_settings();
    let address = config.address();
    info!("...configured as a {} on {address}", config.kind());

    match config.kind() {
        TerminalKind::Urn => {
            let store = Arc::new(MemoryStore::load(config.store_path()?)?);
            let counting_authority = KeyPair::load(config.key_path()?)?;
            let urn = Arc::new(Urn::new(
                network.clone(),
                store,
                counting_authority.public().clone(),
                presenter,
            ));
            let runner = TerminalRunner::start(urn.clone(), network.as_ref(), address, settings).await?;
            if let Err(err) = urn.select_session(config.procedure()?, config.session()?).await {
                runner.shut_down().await;
                return Err(err);
            }
            serve(runner, cli.verbose).await
        }
        TerminalKind::Post => {
            let contact = UrnContact::new(network.clone(), config.urn_address()?, config.session_key()?);
            let booth = KeyPair::load(config.key_path()?)?;
            let post = Arc::new(Post::new(contact, booth, presenter));
            serve(TerminalRunner::start(post, network.as_ref(), address, settings).await?, cli.verbose).await
        }
        TerminalKind::Station => {
            let contact = UrnContact::new(network.clone(), config.urn_address()?, config.session_key()?);
            let station = Arc::new(Station::new(contact, presenter));
            serve(TerminalRunner::start(station, network.as_ref(), address, settings).await?, cli.verbose).await
        }
        TerminalKind::SubStation => {
            let contact = UrnContact::new(network.clone(), config.urn_address()?, config.session_key()?);
            let substation = Arc::new(SubStation::new(contact, presenter));
            serve(TerminalRunner::start(substation, network.as_ref(), address, settings).await?, cli.verbose).await
        }
    }
}

/// Feed badges typed on stdin to the card reader until Ctrl-C, then shut down.
async fn serve<T: Terminal>(runner: TerminalRunner<T>, verbose: bool) -> Result<(), Error> {
    // The poller is noisy from now on.
    if !verbose {
        log4rs_dynamic_filters::DynamicLevelFilter::set(LIVENESS_FILTER, LevelFilter::Warn);
    }

    let badges = async {
        let Some(reader) = runner.card_reader() else {
            return std::future::pending::<()>().await;
        };
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let badge = line.trim();
            if badge.is_empty() {
                continue;
            }
            match reader.swipe(badge).await {
                Ok(outcome) => info!("Badge {badge}: {outcome:?}"),
                Err(err) => error!("Badge {badge}: {err}"),
            }
        }
        std::future::pending::<()>().await
    };

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal,
        _ = badges => Ok(()),
    };
    info!("Shutting down...");
    runner.shut_down().await;
    interrupted.map_err(Error::from)
}

#[tokio::main]
async fn main() {
    // Set up logging.
    log4rs::init_file("log4rs.yaml", log4rs_dynamic_filters::default_deserializers())
        .expect("Failed to initialise logging");
    info!("Initialised logging");

    // Launch the terminal.
    if let Err(err) = run(Cli::parse()).await {
        error!("{}: {}", err.generic_message(), err.specific_message());
        error!("Critical failure, shutting down");
        std::process::exit(1)
    }
}
