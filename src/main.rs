use std::sync::Arc;

use exam_records::config::{AppConfig, ConnectionSettings, SettingsStore};
use exam_records::routes::{router, AppContext};
use exam_records::{io, schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = AppConfig::from_env()?;
    io::prepare_io(&config.config_dir).await?;

    let settings = match SettingsStore::new(&config.config_dir).load_connection().await {
        Ok(settings) => settings,
        Err(err) => {
            log::warn!("{}; starting with default connection settings", err);
            ConnectionSettings::default()
        }
    };

    // The server stays up without a database so the settings can be fixed.
    match schema::prepare_database(&settings).await {
        Ok(status) => log::info!("Database ready: {:?}", status),
        Err(err) => log::warn!("Database not prepared, running offline: {}", err),
    }

    let addr = config.bind;
    let app = router(Arc::new(AppContext::new(config, settings)));
    log::info!("Starting exam records server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
