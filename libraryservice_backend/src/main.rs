use std::sync::Arc;

use actix_web::{App, HttpServer};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::runtime::TokioCurrentThread;
use paperclip::actix::{web, OpenApiExt};
use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use libraryservice_backend::app_config::config_app;
use libraryservice_backend::library_repository::{
    InMemoryLibraryRepository, LibraryRepository, PostgresLibraryRepository,
};
use libraryservice_backend::library_service::LibraryService;
use libraryservice_backend::settings::Settings;

// Based on https://github.com/LukeMathWalker/tracing-actix-web/blob/main/examples/opentelemetry/src/main.rs#L15
fn init_telemetry() {
    let app_name = "libraryservice_backend";

    // Spans are exported to Jaeger in batches
    global::set_text_map_propagator(TraceContextPropagator::new());
    #[allow(deprecated)]
    let tracer = opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name(app_name)
        .install_batch(TokioCurrentThread)
        .expect("Failed to install OpenTelemetry tracer.");

    // Tunable via `RUST_LOG` env variable
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(telemetry)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to install `tracing` subscriber.")
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    let settings = Settings::from_env().expect("Failed to read settings");
    tracing::info!(
        "starting HTTP server at http://localhost:{}, in memory db: {}",
        settings.http_port,
        settings.use_in_memory_db
    );

    let repository: Arc<dyn LibraryRepository> = if settings.use_in_memory_db {
        Arc::new(InMemoryLibraryRepository::default())
    } else {
        Arc::new(
            PostgresLibraryRepository::init(settings.postgres_config())
                .await
                .expect("Failed to init postgres"),
        )
    };
    let library = LibraryService::new(repository, settings.report_top_books);

    HttpServer::new(move || {
        App::new()
            .wrap_api()
            .app_data(web::Data::new(library.clone()))
            .wrap(TracingLogger::default())
            .configure(config_app)
            .with_json_spec_at("/apispec/v2")
            .build()
    })
    .bind(("0.0.0.0", settings.http_port))?
    .run()
    .await
}
