use anyhow::{Error, Result};
use email_service::{app, config::Config, logging::init_tracing};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    app::run(config).await
}
