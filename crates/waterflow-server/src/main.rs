use actix_cors::Cors;
use actix_web::{
    delete, get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use waterflow_core::services::{
    deliver, BrokerClient, ContextQuery, IggyCallbackSubscription, IggyMessenger,
    IggyMessengerConfig, MemoryContextRepo, MemoryLocks,
};
use waterflow_core::{EventBus, FlowData, FlowError, FlowNodeStatus, HandlerError};
use waterflow_runtime::{
    EngineConfig, ExpressionEvaluator, FlowDefinition, FlowEngine, FlowServices, FlowSpec,
    HandlerRegistry, JobToken, ResumeRequest,
};

/// Application state shared across handlers
struct AppState {
    engine: Arc<FlowEngine>,
    registry: Arc<HandlerRegistry>,
}

/// Request body for offering data to a stream
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferRequest {
    #[serde(default = "default_operator")]
    operator: String,
    /// One context is created per business object.
    #[serde(default)]
    business: Vec<Map<String, Value>>,
    #[serde(default)]
    context: Map<String, Value>,
}

fn default_operator() -> String {
    "api".to_string()
}

/// Request body for resuming parked contexts
#[derive(Debug, Deserialize)]
struct ResumeBody {
    contexts: Vec<ResumeRequest>,
}

/// Request body for completing an asynchronous job
#[derive(Debug, Deserialize)]
struct CompleteJobRequest {
    token: JobToken,
    #[serde(default)]
    results: Vec<Map<String, Value>>,
    #[serde(default)]
    error: Option<HandlerError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextQueryParams {
    trace_id: Option<String>,
    node_id: Option<String>,
    status: Option<FlowNodeStatus>,
    to_batch: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleParams {
    timeout_ms: Option<u64>,
}

/// Response for flow registration
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FlowResponse {
    stream_id: String,
    message: String,
}

/// Error response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: i32,
}

fn error_response(e: &FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: e.to_string(),
        code: e.code(),
    };
    match e {
        FlowError::DefinitionNotFound(_) | FlowError::NodeNotFound(_) | FlowError::NotBlocked(_) => {
            HttpResponse::NotFound().json(body)
        }
        FlowError::Definition(_)
        | FlowError::Contract(_)
        | FlowError::Unsupported(_)
        | FlowError::Serialization(_) => HttpResponse::BadRequest().json(body),
        FlowError::Timeout { .. } => HttpResponse::GatewayTimeout().json(body),
        _ => {
            error!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn summary(definition: &FlowDefinition) -> Value {
    serde_json::json!({
        "streamId": definition.stream_id(),
        "metaId": definition.meta_id(),
        "name": definition.name(),
        "version": definition.version(),
        "nodes": definition.node_id_set().len(),
        "events": definition.spec().events.len(),
    })
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "waterflow"
    }))
}

/// List registered flow definitions
#[get("/api/flows")]
async fn list_flows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let flows: Vec<_> = data
        .engine
        .definitions()
        .await
        .iter()
        .map(|d| summary(d))
        .collect();

    Ok(HttpResponse::Ok().json(flows))
}

/// Register a flow definition, replacing any previous version of the stream
#[post("/api/flows")]
async fn register_flow(
    data: web::Data<AppState>,
    spec: web::Json<FlowSpec>,
) -> ActixResult<impl Responder> {
    let spec = spec.into_inner();
    info!("Registering flow: {} ({})", spec.name, spec.stream_id());

    match data.engine.register(spec).await {
        Ok(definition) => Ok(HttpResponse::Created().json(FlowResponse {
            stream_id: definition.stream_id().to_string(),
            message: "Flow registered successfully".to_string(),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Check a definition without registering it
#[post("/api/flows/validate")]
async fn validate_flow(spec: web::Json<FlowSpec>) -> ActixResult<impl Responder> {
    match FlowDefinition::from_spec(spec.into_inner()) {
        Ok(definition) => Ok(HttpResponse::Ok().json(summary(&definition))),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/flows/{stream_id}")]
async fn get_flow(data: web::Data<AppState>, path: web::Path<String>) -> ActixResult<impl Responder> {
    match data.engine.definition(&path.into_inner()).await {
        Ok(definition) => Ok(HttpResponse::Ok().json(definition.spec())),
        Err(e) => Ok(error_response(&e)),
    }
}

#[delete("/api/flows/{stream_id}")]
async fn delete_flow(data: web::Data<AppState>, path: web::Path<String>) -> ActixResult<impl Responder> {
    let stream_id = path.into_inner();
    if data.engine.unregister(&stream_id).await {
        info!("Unregistered flow: {}", stream_id);
        Ok(HttpResponse::Ok().json(serde_json::json!({
            "message": "Flow unregistered successfully"
        })))
    } else {
        Ok(error_response(&FlowError::DefinitionNotFound(stream_id)))
    }
}

/// Offer business data to a stream's start node
#[post("/api/flows/{stream_id}/offer")]
async fn offer(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<OfferRequest>,
) -> ActixResult<impl Responder> {
    let stream_id = path.into_inner();
    let req = req.into_inner();
    let items: Vec<FlowData> = req
        .business
        .into_iter()
        .map(|business| {
            let mut item = FlowData::new(req.operator.clone()).with_business_data(business);
            item.context_data.extend(req.context.clone());
            item
        })
        .collect();

    match data.engine.offer(&stream_id, items).await {
        Ok(trace_id) => Ok(HttpResponse::Accepted().json(serde_json::json!({ "traceId": trace_id }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Resume contexts parked at a manual node
#[post("/api/flows/{stream_id}/nodes/{position}/resume")]
async fn resume(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    req: web::Json<ResumeBody>,
) -> ActixResult<impl Responder> {
    let (stream_id, position) = path.into_inner();

    match data.engine.resume(&stream_id, &position, req.into_inner().contexts).await {
        Ok(resumed) => Ok(HttpResponse::Ok().json(serde_json::json!({ "resumed": resumed }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Readmit a retryable batch
#[post("/api/flows/{stream_id}/retry/{to_batch}")]
async fn retry(data: web::Data<AppState>, path: web::Path<(String, String)>) -> ActixResult<impl Responder> {
    let (stream_id, to_batch) = path.into_inner();

    match data.engine.retry(&stream_id, &to_batch).await {
        Ok(retried) => Ok(HttpResponse::Ok().json(serde_json::json!({ "retried": retried }))),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Hand back the result of an asynchronous job
#[post("/api/jobs/complete")]
async fn complete_job(
    data: web::Data<AppState>,
    req: web::Json<CompleteJobRequest>,
) -> ActixResult<impl Responder> {
    let req = req.into_inner();
    let result = match req.error {
        Some(failure) => Err(failure),
        None => Ok(req.results),
    };

    match data.engine.complete_job(req.token, result).await {
        Ok(completed) => Ok(HttpResponse::Ok().json(serde_json::json!({ "completed": completed }))),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/flows/{stream_id}/contexts")]
async fn list_contexts(
    data: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<ContextQueryParams>,
) -> ActixResult<impl Responder> {
    let params = params.into_inner();
    let mut query = ContextQuery::stream(path.into_inner());
    query.trace_id = params.trace_id;
    query.node_id = params.node_id;
    query.status = params.status;
    query.to_batch = params.to_batch;

    match data.engine.contexts(&query).await {
        Ok(contexts) => Ok(HttpResponse::Ok().json(contexts)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Wait for a trace to settle and return its contexts
#[post("/api/flows/{stream_id}/traces/{trace_id}/settle")]
async fn settle(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    params: web::Query<SettleParams>,
) -> ActixResult<impl Responder> {
    let (stream_id, trace_id) = path.into_inner();
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(30_000));

    match data.engine.settle(&stream_id, &trace_id, timeout).await {
        Ok(contexts) => Ok(HttpResponse::Ok().json(contexts)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// WebSocket endpoint for real-time engine events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.engine.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagged, skipped {} events", skipped);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List handlers served by the in-process broker
#[get("/api/handlers")]
async fn list_handlers(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let handlers: Vec<_> = data
        .registry
        .list_handlers()
        .iter()
        .map(|id| {
            let metadata = data.registry.get_metadata(id);
            serde_json::json!({
                "id": id,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(handlers))
}

/// Iggy settings when a connection string is configured.
fn iggy_config(
    connection_string: Option<String>,
    stream: Option<String>,
    topic: Option<String>,
) -> Option<IggyMessengerConfig> {
    let connection_string = connection_string.filter(|c| !c.trim().is_empty())?;
    let defaults = IggyMessengerConfig::default();
    Some(IggyMessengerConfig {
        connection_string,
        stream_name: stream.unwrap_or(defaults.stream_name),
        topic_name: topic.unwrap_or(defaults.topic_name),
        ..defaults
    })
}

/// Consume published callback envelopes and invoke their handlers.
fn spawn_callback_delivery(subscription: IggyCallbackSubscription, broker: Arc<dyn BrokerClient>) {
    tokio::spawn(async move {
        loop {
            match subscription.poll().await {
                Ok(envelopes) if envelopes.is_empty() => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(envelopes) => {
                    for envelope in &envelopes {
                        deliver(broker.as_ref(), envelope).await;
                    }
                }
                Err(e) => {
                    warn!("Callback poll failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Waterflow Server");

    let mut registry = HandlerRegistry::new();
    waterflow_handlers::register_all(&mut registry);
    let registry = Arc::new(registry);

    let broker: Arc<dyn BrokerClient> = registry.clone();
    let config = EngineConfig::from_env();
    let iggy = iggy_config(
        std::env::var("IGGY_CONNECTION_STRING").ok(),
        std::env::var("IGGY_STREAM").ok(),
        std::env::var("IGGY_TOPIC").ok(),
    );
    let engine = match iggy {
        Some(iggy) => {
            info!("📡 Publishing callbacks to Iggy stream {}", iggy.stream_name);
            let messenger = IggyMessenger::connect(iggy).await?;
            spawn_callback_delivery(messenger.subscribe("waterflow-server"), broker.clone());
            FlowEngine::with_services(FlowServices {
                repo: Arc::new(MemoryContextRepo::new()),
                messenger: Arc::new(messenger),
                locks: Arc::new(MemoryLocks::new()),
                broker,
                evaluator: Arc::new(ExpressionEvaluator::new()),
                events: EventBus::new(config.event_buffer_size),
                config: Arc::new(config),
            })
        }
        None => FlowEngine::with_config(broker, config),
    };

    info!("✅ Engine initialized with {} built-in handlers", registry.list_handlers().len());

    let app_state = web::Data::new(AppState {
        engine: Arc::new(engine),
        registry,
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(validate_flow)
            .service(list_flows)
            .service(register_flow)
            .service(get_flow)
            .service(delete_flow)
            .service(offer)
            .service(resume)
            .service(retry)
            .service(complete_job)
            .service(list_contexts)
            .service(settle)
            .service(websocket_events)
            .service(list_handlers)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
