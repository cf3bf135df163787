use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::{sync::Arc, time::Duration};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use mayara_bridge::{
    host::ProviderRegistry, relay::SpokeRelayFactory, BackendClient, Cli, Fleet, RadarProvider,
    PROVIDER_ID, PROVIDER_NAME, VERSION,
};

mod web;

use web::Web;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(args.verbose.log_level_filter())
        .init();

    // reqwest and tungstenite both need a process-wide rustls provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = args.bridge_config().into_diagnostic()?;
    log::info!(
        "{} v{} bridging mayara-server at {}",
        PROVIDER_NAME,
        VERSION,
        config.authority()
    );

    let client = BackendClient::new(&config).into_diagnostic()?;
    let web = Web::new(args.listen);

    let provider = Arc::new(RadarProvider::new(client.clone()));
    if !web.register_provider(PROVIDER_ID, provider) {
        log::error!("Failed to register radar provider '{}'", PROVIDER_ID);
    }

    let factory = Arc::new(SpokeRelayFactory::new(
        Arc::new(web.clone()),
        config.reconnect_interval(),
    ));
    let fleet = Fleet::new(config, Arc::new(client), factory, Arc::new(web.clone()));

    let web_for_subsys = web.clone();
    let result = Toplevel::new(|s| async move {
        let fleet_for_web = fleet.clone();
        s.start(SubsystemBuilder::new("Fleet", |a| fleet.run_until_shutdown(a)));
        s.start(SubsystemBuilder::new("Web", |a| {
            web_for_subsys.run(fleet_for_web, a)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await;

    web.unregister_provider(PROVIDER_ID);
    result.map_err(Into::into)
}
