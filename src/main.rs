use std::net::SocketAddr;
use std::sync::Arc;

use iothub_digitaltwins_forwarder::config::Config;
use iothub_digitaltwins_forwarder::credential::ManagedIdentityCredential;
use iothub_digitaltwins_forwarder::twins::DigitalTwinsClient;
use iothub_digitaltwins_forwarder::{server, Error};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Error> {
    iothub_digitaltwins_forwarder::set_up_logging();

    info!(
        "Initializing {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load_from_env().inspect_err(|e| error!("{}", e))?;

    // one connection pool for the whole process
    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(config.request_timeout)
        .build()?;

    let credential = Arc::new(ManagedIdentityCredential::new(
        http.clone(),
        config.identity.clone(),
        config.audience.clone(),
    ));
    let twins = Arc::new(DigitalTwinsClient::new(
        http,
        config.adt_service_url.clone(),
        config.api_version.clone(),
        credential,
    ));

    let app = server::router(&config.function_name, twins, config.failure_mode);
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    match &config.adt_service_url {
        Some(url) => info!(
            "forwarding to {} ({} on update failure) - listening on http://{}/{}",
            url, config.failure_mode, addr, config.function_name
        ),
        None => warn!(
            "no digital twins endpoint, invocations will be logged and dropped - listening on http://{}/{}",
            addr, config.function_name
        ),
    }

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
