use gtmcore::config::GtmConfig;
use gtmcore::control_file::FileControlFile;
use gtmcore::dispatch::Dispatcher;
use gtmcore::replication::ReplicationShim;
use gtmcore::sequence::NoopSequenceManager;
use gtmcore::server::Server;
use gtmcore::TransactionManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GtmConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GtmConfig::default()
    });

    tracing::info!(
        bind_addr = %config.bind_addr,
        n_max = config.n_max,
        standby = config.standby_addr.is_some(),
        "gtmd starting"
    );

    let control_file = Arc::new(FileControlFile::new(&config.data_dir)?);
    let manager = Arc::new(TransactionManager::new(
        config.n_max,
        false,
        config.control_interval,
        Arc::new(NoopSequenceManager),
        control_file,
    ));
    manager.start()?;

    let standby_addr = config
        .standby_addr
        .as_ref()
        .map(|addr| addr.parse())
        .transpose()
        .map_err(|e| format!("invalid standby_addr: {e}"))?;
    let replication = Arc::new(ReplicationShim::new(standby_addr, config.synchronous_backup));

    let dispatcher = Arc::new(Dispatcher::new(manager, replication, config.gid_max, config.sid_max));
    let server = Server::new(dispatcher);

    server.start(config.bind_addr()?).await?;
    Ok(())
}
