use bio_collector::{
    api::ApiClient,
    config::{Cli, Config, Credentials},
    logging,
    process::{Collector, RotationPolicy},
    request::InstagramClient,
    store::MongoStore,
    vpn::{ServerPool, VpnHandler},
    Result, LOG_DIR, LOG_NAME,
};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LOG_DIR, LOG_NAME)?;

    let config = Config::from_env()?;
    let provider = cli.provider;
    tracing::info!("Starting bio collector with {provider}");

    let credentials = Credentials::load(provider, provider.credentials_path())?;
    let pool = ServerPool::load(provider.vpn_dir())?;
    let vpn = VpnHandler::new(pool, credentials);

    let instagram = InstagramClient::new()?;
    let api = ApiClient::new(&config.api_route, &config.secret_token)?;
    let store = MongoStore::connect(
        &config.mongo_connection_string,
        &config.mongo_db,
        &config.mongo_collection,
    )
    .await?;

    Collector::new(vpn, instagram, api, store, RotationPolicy::default())
        .run()
        .await?;
    Ok(())
}
