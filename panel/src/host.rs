use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use remoteiot_common::{
    codec::decode_reading, types::TIMESTAMP_FORMAT, BrokerConfig, CodecError, DebugMessage,
    RuntimeConfig, TemperatureSample, TimeOfDay, TopicConfig, UpdatePayload,
};

use crate::{
    ota::{build_update, mqtt_options, send_update, CodeUpload, OtaSendStatus},
    store::StoreHandle,
};

#[derive(Clone)]
struct AppState {
    store: StoreHandle,
    runtime: Arc<Mutex<RuntimeConfig>>,
    /// Broker the long-lived subscription connected with at startup.
    subscribed_broker: Arc<BrokerConfig>,
    timezone: Tz,
    ota: Arc<Mutex<OtaSendStatus>>,
    files: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct PeriodQuery {
    #[serde(default)]
    period: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YearQuery {
    #[serde(default)]
    year: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    removed: usize,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TemperatureUpdate {
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct CodeSendResponse {
    sent: bool,
    filename: String,
    sha256: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct BrokerConfigView {
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
    #[serde(rename = "keepAliveSecs")]
    keep_alive_secs: u64,
    #[serde(rename = "mqttTls")]
    mqtt_tls: bool,
}

#[derive(Debug, Deserialize)]
struct BrokerConfigUpdate {
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser", default)]
    mqtt_user: String,
    #[serde(rename = "mqttPass", default)]
    mqtt_pass: Option<String>,
    #[serde(rename = "mqttTls", default)]
    mqtt_tls: Option<bool>,
}

/// Where one OTA send goes, captured from the runtime config when the
/// request arrives.
struct SendTarget {
    broker: BrokerConfig,
    client_id: String,
    topic: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct BrokerUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    broker: BrokerConfigView,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let files = AppStore::new();
    let mut runtime = files.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.apply_env(|key| std::env::var(key).ok());
    runtime.sanitize();

    let timezone = runtime.panel.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!("unknown timezone `{}`, using UTC", runtime.panel.timezone);
        Tz::UTC
    });

    let options = mqtt_options(&runtime.broker, runtime.panel.client_id.clone());
    let (mqtt, eventloop) = AsyncClient::new(options, 64);

    let port = runtime.panel.http_port;
    let topics = runtime.topics.clone();
    let app_state = AppState {
        store: StoreHandle::spawn(runtime.panel.reading_capacity, runtime.panel.debug_capacity),
        subscribed_broker: Arc::new(runtime.broker.clone()),
        runtime: Arc::new(Mutex::new(runtime)),
        timezone,
        ota: Arc::new(Mutex::new(OtaSendStatus::default())),
        files,
    };

    spawn_mqtt_loop(app_state.clone(), mqtt, eventloop, topics);

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/readings", get(handle_get_readings))
        .route("/api/readings/clear", post(handle_clear_readings))
        .route("/api/readings/clear-year", post(handle_clear_year))
        .route("/api/temperature", get(handle_get_temperatures))
        .route("/api/debug", get(handle_get_debug))
        .route("/api/code", post(handle_post_code))
        .route("/api/ota/status", get(handle_get_ota_status))
        .route(
            "/api/broker",
            get(handle_get_broker).put(handle_put_broker),
        )
        .route("/temperature", post(handle_post_temperature))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind panel server at {addr}"))?;

    info!("panel listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn subscribe_topics(mqtt: &AsyncClient, topics: &TopicConfig) {
    for topic in [topics.sensor.as_str(), topics.debug.as_str()] {
        if let Err(err) = mqtt.try_subscribe(topic, QoS::AtMostOnce) {
            warn!("failed to subscribe to {topic}: {err}");
        }
    }
}

fn spawn_mqtt_loop(
    app_state: AppState,
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    topics: TopicConfig,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &topics, &message.topic, &message.payload)
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    subscribe_topics(&mqtt, &topics);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topics: &TopicConfig,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let now = now_timestamp(app_state.timezone);
    if topic == topics.sensor {
        let reading = decode_reading(payload, &now)
            .with_context(|| format!("bad sensor message on {topic}"))?;
        app_state.store.append_reading(reading).await?;
    } else if topic == topics.debug {
        let text = String::from_utf8(payload.to_vec()).context("non utf8 debug message")?;
        info!("device debug: {text}");
        app_state
            .store
            .push_debug(DebugMessage {
                received_at: now,
                text,
            })
            .await?;
    }

    Ok(())
}

async fn handle_get_readings(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> impl IntoResponse {
    let period = match parse_period(query.period.as_deref()) {
        Ok(period) => period,
        Err(response) => return response,
    };

    match state.store.readings(period).await {
        Ok(readings) => Json(readings).into_response(),
        Err(err) => store_error(err),
    }
}

async fn handle_get_temperatures(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> impl IntoResponse {
    let period = match parse_period(query.period.as_deref()) {
        Ok(period) => period,
        Err(response) => return response,
    };

    match state.store.temperatures(period).await {
        Ok(samples) => Json(samples).into_response(),
        Err(err) => store_error(err),
    }
}

async fn handle_clear_readings(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.clear().await {
        Ok(removed) => Json(ClearResponse {
            removed,
            message: "All data has been cleared successfully!".to_string(),
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn handle_clear_year(
    State(state): State<AppState>,
    Query(query): Query<YearQuery>,
) -> impl IntoResponse {
    let Some(year) = query
        .year
        .as_deref()
        .and_then(|value| value.trim().parse::<i32>().ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Please enter a valid year.");
    };

    match state.store.clear_year(year).await {
        Ok(removed) => Json(ClearResponse {
            removed,
            message: format!("Cleared {removed} entries from {year}."),
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn handle_get_debug(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.debug().await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => store_error(err),
    }
}

async fn handle_post_code(
    State(state): State<AppState>,
    Json(upload): Json<CodeUpload>,
) -> impl IntoResponse {
    let (target, max_bytes) = {
        let runtime = state.runtime.lock().await;
        (
            SendTarget {
                broker: runtime.broker.clone(),
                client_id: runtime.panel.client_id.clone(),
                topic: runtime.topics.code_update.clone(),
                timeout: Duration::from_millis(runtime.panel.publish_timeout_ms),
            },
            runtime.device.max_payload_bytes,
        )
    };

    let payload = match build_update(&upload, max_bytes) {
        Ok(payload) => payload,
        Err(err @ CodecError::PayloadTooLarge { .. }) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, &err.to_string())
        }
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    {
        let mut ota = state.ota.lock().await;
        if ota.in_progress {
            return error_response(StatusCode::CONFLICT, "OTA send already in progress");
        }
        ota.in_progress = true;
    }

    // The send owns its status bookkeeping, so a dropped request cannot
    // leave `in_progress` set.
    let send = tokio::spawn(run_send(state.ota.clone(), target, payload));
    match send.await {
        Ok(Ok(payload)) => Json(CodeSendResponse {
            sent: true,
            filename: payload.filename,
            sha256: payload.sha256,
            message: "Code sent to device".to_string(),
        })
        .into_response(),
        Ok(Err(message)) => error_response(StatusCode::BAD_GATEWAY, &message),
        Err(err) => {
            warn!("OTA send task failed: {err}");
            state.ota.lock().await.in_progress = false;
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "OTA send task failed")
        }
    }
}

async fn run_send(
    status: Arc<Mutex<OtaSendStatus>>,
    target: SendTarget,
    payload: UpdatePayload,
) -> Result<UpdatePayload, String> {
    let result = send_update(
        &target.broker,
        &target.client_id,
        &target.topic,
        &payload,
        target.timeout,
    )
    .await;

    let mut ota = status.lock().await;
    ota.in_progress = false;
    ota.last_completed_epoch = Some(Utc::now().timestamp());
    ota.last_filename = Some(payload.filename.clone());
    ota.last_sha256 = payload.sha256.clone();

    match result {
        Ok(()) => {
            info!("code {} sent on {}", payload.filename, target.topic);
            ota.sent_count = ota.sent_count.saturating_add(1);
            ota.last_error = None;
            Ok(payload)
        }
        Err(err) => {
            let message = format!("MQTT OTA send error: {err:#}");
            warn!("{message}");
            ota.last_error = Some(message.clone());
            Err(message)
        }
    }
}

async fn handle_get_ota_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.ota.lock().await.clone();
    Json(status)
}

async fn handle_post_temperature(
    State(state): State<AppState>,
    Json(update): Json<TemperatureUpdate>,
) -> impl IntoResponse {
    if !update.temperature.is_finite() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    }

    let sample = TemperatureSample {
        timestamp: now_timestamp(state.timezone),
        temperature: update.temperature,
    };
    match state.store.append_temperature(sample).await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(err) => store_error(err),
    }
}

async fn handle_get_broker(State(state): State<AppState>) -> impl IntoResponse {
    let runtime = state.runtime.lock().await;
    Json(build_broker_config_view(&runtime.broker))
}

async fn handle_put_broker(
    State(state): State<AppState>,
    Json(update): Json<BrokerConfigUpdate>,
) -> impl IntoResponse {
    if update.mqtt_host.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "mqttHost cannot be empty");
    }
    if update.mqtt_port == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "mqttPort must be between 1 and 65535",
        );
    }

    let mut stored = state
        .files
        .load_runtime_config()
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load existing runtime config for update: {err:#}");
            RuntimeConfig::default()
        });

    let mut broker = state.runtime.lock().await.broker.clone();
    broker.host = update.mqtt_host.trim().to_string();
    broker.port = update.mqtt_port;
    broker.user = update.mqtt_user;
    if let Some(pass) = update.mqtt_pass {
        broker.pass = pass;
    }
    if let Some(tls) = update.mqtt_tls {
        broker.tls = tls;
    }

    stored.broker = broker.clone();
    if let Err(err) = state.files.save_runtime_config(&stored).await {
        warn!("failed to persist broker config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist broker settings",
        );
    }

    state.runtime.lock().await.broker = broker.clone();

    Json(BrokerUpdateResponse {
        restart_required: broker != *state.subscribed_broker,
        broker: build_broker_config_view(&broker),
    })
    .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("REMOTEIOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.remoteiot"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn build_broker_config_view(broker: &BrokerConfig) -> BrokerConfigView {
    BrokerConfigView {
        mqtt_host: broker.host.clone(),
        mqtt_port: broker.port,
        mqtt_user: broker.user.clone(),
        mqtt_pass_set: !broker.pass.is_empty(),
        keep_alive_secs: broker.keep_alive_secs,
        mqtt_tls: broker.tls,
    }
}

fn parse_period(value: Option<&str>) -> Result<TimeOfDay, axum::response::Response> {
    TimeOfDay::parse(value.unwrap_or_default()).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "Invalid period. Use all, morning, afternoon, evening or night",
        )
    })
}

fn now_timestamp(timezone: Tz) -> String {
    Utc::now()
        .with_timezone(&timezone)
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

fn store_error(err: anyhow::Error) -> axum::response::Response {
    warn!("store request failed: {err:#}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
