use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_s3::Client as S3Client;
use plum_backend::auth::{AuthMiddleware, JwtService};
use plum_backend::config::{AppConfig, DatabaseConfig, StorageConfig};
use plum_backend::db::{DynamoDbRepository, InMemoryRepository, ResultRepository};
use plum_backend::model::{InferenceEngine, ModelCache, TorchScriptLoader};
use plum_backend::pipeline::{ClassificationService, RecordWriter};
use plum_backend::routes::configure_routes;
use plum_backend::storage::{ImageStore, LocalImageStore, S3ImageStore};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let mut aws = None;

    let store: Arc<dyn ImageStore> = match &config.storage {
        StorageConfig::S3 { bucket } => {
            log::info!("Storing images in S3 bucket {}", bucket);
            let client = S3Client::new(&aws_sdk_config(&mut aws).await);
            Arc::new(S3ImageStore::new(client, bucket.clone()))
        }
        StorageConfig::Local { media_root } => {
            log::info!("Storing images under {}", media_root.display());
            Arc::new(LocalImageStore::new(media_root.clone()))
        }
    };

    let repository: Arc<dyn ResultRepository> = match &config.database {
        DatabaseConfig::Dynamodb {
            results_table,
            batches_table,
        } => {
            log::info!(
                "Using DynamoDB tables {} and {}",
                results_table,
                batches_table
            );
            let client = DynamoDbClient::new(&aws_sdk_config(&mut aws).await);
            Arc::new(DynamoDbRepository::new(
                client,
                results_table.clone(),
                batches_table.clone(),
            ))
        }
        DatabaseConfig::Memory => {
            log::warn!("Using the in-memory repository; results are lost on restart");
            Arc::new(InMemoryRepository::new())
        }
    };

    let models = Arc::new(ModelCache::new(Arc::new(TorchScriptLoader::new(
        &config.model,
    ))));
    if config.model.preload {
        match models.get().await {
            Ok(handle) => log::info!(
                "Preloaded model {} v{}",
                handle.metadata.model_name,
                handle.metadata.version
            ),
            Err(e) => log::error!("Model preload failed, will retry on first request: {}", e),
        }
    }

    let service = web::Data::new(ClassificationService::new(
        &config.upload,
        models,
        InferenceEngine::new(config.model.max_concurrent_inference),
        RecordWriter::new(store, repository),
    ));

    let jwt_service = JwtService::new(&config.jwt_secret);
    let auth_middleware = AuthMiddleware::new(jwt_service);
    let allowed_origins = config.server.allowed_origins.clone();
    let bind_address = config.bind_address();

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "PATCH", "OPTIONS"])
            .allowed_headers(vec![
                actix_web::http::header::AUTHORIZATION,
                actix_web::http::header::ACCEPT,
                actix_web::http::header::CONTENT_TYPE,
            ])
            .max_age(3600);
        if allowed_origins.is_empty() {
            cors = cors.allow_any_origin();
        } else {
            for origin in &allowed_origins {
                cors = cors.allowed_origin(origin);
            }
        }

        App::new()
            .wrap(cors)
            .app_data(service.clone())
            .configure(|cfg| configure_routes(cfg, auth_middleware.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}

async fn aws_sdk_config(cache: &mut Option<SdkConfig>) -> SdkConfig {
    if let Some(config) = cache {
        return config.clone();
    }
    let loaded = aws_config::defaults(BehaviorVersion::latest()).load().await;
    *cache = Some(loaded.clone());
    loaded
}
