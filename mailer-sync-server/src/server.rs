use crate::{auth::AdminGate, handlers, settings::Settings};
use actix_web::{dev::Server, web, web::Data, App, HttpServer};
use mailer_sync_logic::{
    mailerlite,
    orchestrator::{
        backfill::BackfillOrchestrator,
        bidirectional::{self, BidirectionalOrchestrator},
        diagnostic::DiagnosticScanner,
        id_repair::IdRepairOrchestrator,
    },
    rate_limiter::{self, RateLimiter},
    record_sync::RecordSynchronizer,
    status,
};
use sea_orm::DatabaseConnection;
use std::{net::TcpListener, sync::Arc};
use tracing_actix_web::TracingLogger;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub gate: AdminGate,
    pub synchronizer: RecordSynchronizer,
    pub backfill: BackfillOrchestrator,
    pub bidirectional: BidirectionalOrchestrator,
    pub id_repair: Arc<IdRepairOrchestrator>,
    pub diagnostic: Arc<DiagnosticScanner>,
}

pub fn run(settings: Settings, db: DatabaseConnection) -> Result<Server, anyhow::Error> {
    let db = Arc::new(db);
    let limiter = Arc::new(RateLimiter::new(
        settings.sync.mailerlite.requests_per_minute,
    ));
    let client = mailerlite::Client::new(&settings.sync.mailerlite, limiter.clone())?;
    let synchronizer = RecordSynchronizer::new(db.clone(), client.clone());

    let backfill = BackfillOrchestrator::new(
        db.clone(),
        client.clone(),
        settings.sync.backfill.clone(),
    );
    let bidirectional =
        BidirectionalOrchestrator::new(db.clone(), client.clone(), synchronizer.clone());
    let id_repair = Arc::new(IdRepairOrchestrator::new(db.clone(), client.clone()));
    let diagnostic = Arc::new(DiagnosticScanner::new(db.clone(), client));

    let _snapshot_writer = rate_limiter::spawn_snapshot_writer(
        limiter,
        db.clone(),
        settings.sync.rate_limit_snapshot_interval,
    );
    let _stall_watchdog = status::spawn_stall_watchdog(db.clone());
    if settings.sync.worker.enabled {
        let _worker =
            bidirectional::spawn_worker(bidirectional.clone(), settings.sync.worker.clone());
    }

    let state = AppState {
        db,
        gate: AdminGate::new(settings.auth.clone()),
        synchronizer,
        backfill,
        bidirectional,
        id_repair,
        diagnostic,
    };

    let listener = TcpListener::bind(settings.server.addr)?;
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(Data::new(state.clone()))
            .service(
                web::scope("/api/v1/sync")
                    .route("/backfill", web::post().to(handlers::run_backfill))
                    .route("/bidirectional", web::post().to(handlers::run_bidirectional))
                    .route("/id-repair", web::post().to(handlers::run_id_repair))
                    .route("/diagnostic", web::post().to(handlers::run_diagnostic))
                    .route(
                        "/conflicts/{id}/resolve",
                        web::post().to(handlers::resolve_conflict),
                    )
                    .route("/status", web::get().to(handlers::sync_status)),
            )
    })
    .listen(listener)?
    .run();
    Ok(server)
}
