pub mod api;
pub mod core;
pub mod storage;
pub mod utils;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tracing::{info, warn};

use crate::{
    core::MatchEngine,
    storage::{EmployeeStore, PgEmployeeStore},
    utils::{
        config::Config,
        error::{EngineError, Result},
        logging::{RequestLog, LOG_FILE},
    },
};

pub struct Application {
    config: Arc<Config>,
    engine: Arc<MatchEngine>,
    store: Arc<dyn EmployeeStore>,
}

impl Application {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let request_log = Arc::new(RequestLog::open(LOG_FILE));

        info!("Connecting to employee store...");
        let store: Arc<dyn EmployeeStore> =
            Arc::new(PgEmployeeStore::connect(&config.database).await?);

        let engine = Arc::new(MatchEngine::new(config.clone(), request_log));

        Ok(Self {
            config,
            engine,
            store,
        })
    }

    /// Startup index build. A failure leaves identification unavailable
    /// but never prevents the service from coming up; /reload_index can
    /// retry once the store recovers.
    pub async fn build_index(&self) {
        info!("Building employee fingerprint index...");
        match self.engine.rebuild_index(self.store.as_ref()).await {
            Ok(stats) => {
                info!(
                    employees = stats.employees_loaded,
                    templates = stats.templates_loaded,
                    "index ready"
                );
            }
            Err(e) => {
                warn!(
                    "employee index not built: {}; /identify_employee will not work until /reload_index succeeds",
                    e
                );
            }
        }
    }

    pub async fn run(self) -> Result<()> {
        let engine_data = web::Data::from(self.engine.clone());
        let store_data = web::Data::from(self.store.clone());
        let host = self.config.service.fp_bind_host.clone();
        let port = self.config.service.fp_bind_port;

        info!("Starting API server on {}:{}", host, port);
        HttpServer::new(move || {
            App::new()
                .wrap(Cors::permissive())
                .app_data(engine_data.clone())
                .app_data(store_data.clone())
                .configure(api::routes::configure)
        })
        .bind((host.as_str(), port))
        .map_err(|e| EngineError::Init(format!("Failed to bind API server: {}", e)))?
        .run()
        .await
        .map_err(|e| EngineError::Init(e.to_string()))?;

        Ok(())
    }

    pub fn engine(&self) -> &Arc<MatchEngine> {
        &self.engine
    }
}
