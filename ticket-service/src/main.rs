use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use box_office::config_parser::load_settings;
use box_office::shutdown::{run_with_graceful_shutdown, ShutdownCoordinator, StoreShutdown, TaskShutdown};
use box_office::sweeper::spawn_hold_sweeper;
use box_office::{BoxOfficeError, CancellationResult, ErrorKind, LifecycleEngine, Metrics};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

mod service;

use service::{parse_id, BoxOfficeService, EventView, ReservationView};

#[derive(Parser, Debug)]
#[command(name = "ticket-service")]
#[command(about = "Box office REST API: events, reservations, payments and cancellations")]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8080")]
    port: u16,

    /// Properties file; defaults and BOX_OFFICE__* variables apply without one
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub name: String,
    pub event_type: String,
    pub starts_at: String,
    pub ends_at: String,
    pub categories: Vec<CategoryRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CategoryRequest {
    pub label: String,
    pub display_order: Option<u32>,
    pub price_cents: u64,
    pub capacity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    pub customer_id: String,
    pub event_id: String,
    pub category_id: String,
    pub quantity: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct PayRequest {
    method: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    info!("Starting box office on port {}", args.port);
    info!("Config file: {:?}", args.config);

    let settings = load_settings(args.config.as_deref())?;
    info!("Gateway settings: {:?}", settings.gateway);

    let metrics = Arc::new(Metrics::new()?);
    let engine = Arc::new(LifecycleEngine::from_settings(&settings, metrics)?);
    let restored = engine.restore()?;
    info!(
        "Recovered {} events and {} reservations",
        restored.events, restored.reservations
    );

    let coordinator = ShutdownCoordinator::default();
    let sweeper = spawn_hold_sweeper(
        engine.clone(),
        settings.policy.sweep_interval(),
        coordinator.subscribe(),
    );
    coordinator
        .register_component(Box::new(TaskShutdown::new("hold-sweeper", sweeper)))
        .await;
    coordinator
        .register_component(Box::new(StoreShutdown::new(engine.store().clone())))
        .await;

    let service = BoxOfficeService::new(engine);

    let app = Router::new()
        .route("/events", post(create_event).get(list_events))
        .route("/events/:event_id", get(get_event).delete(delete_event))
        .route("/events/:event_id/cancel", post(cancel_event))
        .route("/events/:event_id/reservations", get(event_reservations))
        .route("/reservations", post(create_reservation))
        .route("/reservations/:reservation_id", get(get_reservation))
        .route("/reservations/:reservation_id/pay", post(pay_reservation))
        .route("/reservations/:reservation_id/cancel", post(cancel_reservation))
        .route("/reservations/:reservation_id/refund", post(retry_refund))
        .route("/reservations/:reservation_id/reconcile", post(reconcile))
        .route("/metrics", get(export_metrics))
        .route("/health", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Box office listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    run_with_graceful_shutdown(
        "ticket-service",
        || async move {
            axum::serve(listener, app).await?;
            Ok(())
        },
        coordinator,
    )
    .await?;

    Ok(())
}

fn status_for(error: &BoxOfficeError) -> StatusCode {
    match error.kind() {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::PaymentDeclined => StatusCode::PAYMENT_REQUIRED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::CapacityExceeded
        | ErrorKind::LateCancellation
        | ErrorKind::StateConflict
        | ErrorKind::EventNotBookable
        | ErrorKind::AlreadyCancelled => StatusCode::CONFLICT,
        ErrorKind::HoldExpired => StatusCode::GONE,
        ErrorKind::GatewayUnavailable | ErrorKind::StorageUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::InvalidToken | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T>(context: &str, result: box_office::Result<T>) -> ApiResult<T> {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) if e.is_user_visible() => {
            warn!("{}: {}", context, e);
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => {
            error!("{}: {}", context, e);
            (
                status_for(&e),
                Json(ApiResponse::error("internal error".to_string())),
            )
        }
    }
}

async fn create_event(
    State(service): State<BoxOfficeService>,
    Json(request): Json<CreateEventRequest>,
) -> ApiResult<EventView> {
    respond("Error creating event", service.create_event(request))
}

async fn list_events(State(service): State<BoxOfficeService>) -> ApiResult<Vec<EventView>> {
    respond("Error listing events", service.list_events())
}

async fn get_event(
    State(service): State<BoxOfficeService>,
    Path(event_id): Path<String>,
) -> ApiResult<EventView> {
    let result = parse_id(&event_id).and_then(|id| service.get_event(&id));
    respond("Error getting event", result)
}

async fn delete_event(
    State(service): State<BoxOfficeService>,
    Path(event_id): Path<String>,
) -> ApiResult<EventView> {
    let result = parse_id(&event_id).and_then(|id| service.delete_event(&id));
    respond("Error deleting event", result)
}

async fn cancel_event(
    State(service): State<BoxOfficeService>,
    Path(event_id): Path<String>,
) -> ApiResult<Vec<CancellationResult>> {
    let result = match parse_id(&event_id) {
        Ok(id) => service.cancel_event(&id).await,
        Err(e) => Err(e),
    };
    respond("Error cancelling event", result)
}

async fn event_reservations(
    State(service): State<BoxOfficeService>,
    Path(event_id): Path<String>,
) -> ApiResult<Vec<ReservationView>> {
    let result = parse_id(&event_id).and_then(|id| service.event_reservations(&id));
    respond("Error listing reservations", result)
}

async fn create_reservation(
    State(service): State<BoxOfficeService>,
    Json(request): Json<CreateReservationRequest>,
) -> ApiResult<ReservationView> {
    respond("Error creating reservation", service.create_reservation(request))
}

async fn get_reservation(
    State(service): State<BoxOfficeService>,
    Path(reservation_id): Path<String>,
) -> ApiResult<ReservationView> {
    let result = parse_id(&reservation_id).and_then(|id| service.get_reservation(&id));
    respond("Error getting reservation", result)
}

async fn pay_reservation(
    State(service): State<BoxOfficeService>,
    Path(reservation_id): Path<String>,
    Json(request): Json<PayRequest>,
) -> ApiResult<ReservationView> {
    let result = match parse_id(&reservation_id) {
        Ok(id) => service.pay(&id, &request.method).await,
        Err(e) => Err(e),
    };
    respond("Error paying reservation", result)
}

async fn cancel_reservation(
    State(service): State<BoxOfficeService>,
    Path(reservation_id): Path<String>,
) -> ApiResult<CancellationResult> {
    let result = match parse_id(&reservation_id) {
        Ok(id) => service.cancel(&id).await,
        Err(e) => Err(e),
    };
    respond("Error cancelling reservation", result)
}

async fn retry_refund(
    State(service): State<BoxOfficeService>,
    Path(reservation_id): Path<String>,
) -> ApiResult<CancellationResult> {
    let result = match parse_id(&reservation_id) {
        Ok(id) => service.retry_refund(&id).await,
        Err(e) => Err(e),
    };
    respond("Error retrying refund", result)
}

async fn reconcile(
    State(service): State<BoxOfficeService>,
    Path(reservation_id): Path<String>,
) -> ApiResult<ReservationView> {
    let result = match parse_id(&reservation_id) {
        Ok(id) => service.reconcile(&id).await,
        Err(e) => Err(e),
    };
    respond("Error reconciling payment", result)
}

async fn export_metrics(State(service): State<BoxOfficeService>) -> (StatusCode, String) {
    match service.metrics() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!("Error exporting metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn health_check() -> Json<ApiResponse<String>> {
    Json(ApiResponse::success("OK".to_string()))
}
