//! Drives the client against an in-process charger built with axum.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::Form;
use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::Uri;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::any;
use axum::routing::get;
use axum::routing::post;
use openevse_http::ClaimRequest;
use openevse_http::ClientError;
use openevse_http::ClientOptions;
use openevse_http::LimitRequest;
use openevse_http::OpenEvse;
use openevse_http::OverrideRequest;
use openevse_http::WsState;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Clone)]
struct Charger {
    status: Value,
    config: Value,
    require_auth: bool,
    calls: Arc<Mutex<Vec<(String, String, Value)>>>,
}

impl Charger {
    fn new() -> Self {
        Self {
            status: json!({
                "state": 254,
                "elapsed": 17832,
                "temp": 296,
                "watthour": 64582,
                "wattsec": 106234272,
                "voltage": 240,
                "amp": 0,
                "pilot": 48,
                "divertmode": 1,
                "divert_active": false,
            }),
            config: json!({
                "firmware": "7.1.3",
                "protocol": "-",
                "version": "4.1.7",
                "service": 2,
                "max_current_hard": 48,
                "min_current_hard": 6,
                "max_current_soft": 48,
                "wifi_serial": "1234567890AB",
                "buildenv": "openevse_wifi_v1",
                "led_brightness": 125,
            }),
            require_auth: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, method: &Method, uri: &Uri, body: Value) {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), uri.path().to_string(), body));
    }

    fn calls_to(&self, method: &str, path: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| m == method && p == path)
            .map(|(_, _, b)| b.clone())
            .collect()
    }
}

fn authorised(charger: &Charger, headers: &HeaderMap) -> bool {
    !charger.require_auth || headers.contains_key("authorization")
}

async fn status(State(c): State<Charger>, headers: HeaderMap) -> Response {
    if !authorised(&c, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(c.status.clone()).into_response()
}

async fn config(State(c): State<Charger>) -> Json<Value> {
    Json(c.config.clone())
}

async fn record_json(
    State(c): State<Charger>,
    method: Method,
    uri: Uri,
    body: Option<Json<Value>>,
) -> Json<Value> {
    c.record(&method, &uri, body.map(|Json(b)| b).unwrap_or(Value::Null));
    Json(json!({"msg": "done"}))
}

async fn divertmode(
    State(c): State<Charger>,
    method: Method,
    uri: Uri,
    Form(form): Form<HashMap<String, String>>,
) -> &'static str {
    c.record(&method, &uri, json!(form));
    "Divertmode changed"
}

async fn rapi(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    let cmd = q.get("rapi").cloned().unwrap_or_default();
    let ret = if cmd == "$SC 99" { "$NK^21" } else { "$OK^20" };
    Json(json!({"cmd": cmd, "ret": ret}))
}

async fn override_get() -> Json<Value> {
    Json(json!({"state": "disabled", "auto_release": true}))
}

async fn claims_target() -> Json<Value> {
    Json(json!({"properties": {"state": "active", "charge_current": 32}, "claims": {}}))
}

async fn claims() -> Json<Value> {
    Json(json!([{"client": 20, "priority": 50, "state": "disabled"}]))
}

async fn release() -> Json<Value> {
    Json(json!({
        "tag_name": "v4.1.8",
        "body": "x".repeat(400),
        "html_url": "https://github.com/OpenEVSE/ESP32_WiFi_V4.x/releases/tag/v4.1.8",
    }))
}

async fn ws(upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(|mut socket| async move {
        let frame = json!({"amp": 16000, "state": 3}).to_string();
        if socket.send(Message::Text(frame)).await.is_ok() {
            // Hold the connection open until the client goes away
            while let Some(Ok(_)) = socket.recv().await {}
        }
    })
}

async fn spawn(charger: Charger) -> (OpenEvse, Charger) {
    let app = Router::new()
        .route("/status", get(status).post(record_json))
        .route("/config", get(config).post(record_json))
        .route("/r", get(rapi))
        .route(
            "/override",
            get(override_get).post(record_json).patch(record_json).delete(record_json),
        )
        .route("/claims", get(claims))
        .route("/claims/target", get(claims_target))
        .route("/claims/20", any(record_json))
        .route("/limit", any(record_json))
        .route("/restart", post(record_json))
        .route("/divertmode", post(divertmode))
        .route("/repos/OpenEVSE/ESP32_WiFi_V4.x/releases/latest", get(release))
        .route("/ws", get(ws))
        .with_state(charger.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let options = ClientOptions {
        release_api: format!("http://{}", addr),
        reconnect_delay: Duration::from_millis(50),
        ..Default::default()
    };
    let client = OpenEvse::new(addr.to_string(), options).unwrap();
    (client, charger)
}

#[tokio::test]
async fn test_update_populates_readings() {
    let (client, _) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    let readings = client.readings();
    assert_eq!(readings.state().unwrap(), "sleeping");
    assert_eq!(readings.usage_total().unwrap(), 64.582);
    assert_eq!(readings.wifi_firmware().unwrap(), "4.1.7");
    assert!(client.version_check("4.1.0"));
    assert!(!client.version_check("4.2.2"));
}

#[tokio::test]
async fn test_identity() {
    let (client, _) = spawn(Charger::new()).await;
    let identity = client.test_and_get().await.unwrap();
    assert_eq!(identity.serial, "1234567890AB");
    assert_eq!(identity.model, "openevse_wifi_v1");

    let mut no_serial = Charger::new();
    no_serial.config.as_object_mut().unwrap().remove("wifi_serial");
    let (client, _) = spawn(no_serial).await;
    assert!(matches!(
        client.test_and_get().await,
        Err(ClientError::MissingSerial)
    ));
}

#[tokio::test]
async fn test_authentication_required() {
    let mut charger = Charger::new();
    charger.require_auth = true;
    let (client, _) = spawn(charger).await;
    assert!(matches!(
        client.update().await,
        Err(ClientError::AuthenticationFailed)
    ));

    let options = ClientOptions {
        username: Some("admin".into()),
        password: Some("secret".into()),
        ..Default::default()
    };
    let authed = OpenEvse::new(client.host(), options).unwrap();
    authed.update().await.unwrap();
    assert_eq!(authed.readings().state().unwrap(), "sleeping");
}

#[tokio::test]
async fn test_rapi_echo() {
    let (client, _) = spawn(Charger::new()).await;
    let (cmd, ret) = client.send_command("$SC 16").await.unwrap();
    assert_eq!(cmd, "$SC 16");
    assert_eq!(ret, "$OK^20");

    let (_, ret) = client.send_command("$SC 99").await.unwrap();
    assert_eq!(ret, "$NK^21");
}

#[tokio::test]
async fn test_set_current_writes_config() {
    let (client, charger) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    client.set_current(16).await.unwrap();
    assert_eq!(
        charger.calls_to("POST", "/config"),
        vec![json!({"max_current_soft": 16})]
    );
    assert_eq!(client.readings().max_current_soft().unwrap(), 16);

    assert!(matches!(
        client.set_current(80).await,
        Err(ClientError::OutOfRange { min: 6, max: 48, .. })
    ));
}

#[tokio::test]
async fn test_led_brightness_writes_config() {
    let (client, charger) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    client.set_led_brightness(42).await.unwrap();
    assert_eq!(
        charger.calls_to("POST", "/config"),
        vec![json!({"led_brightness": 42})]
    );
}

#[tokio::test]
async fn test_override_and_charge_current() {
    let (client, charger) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    assert_eq!(client.override_state().await.unwrap(), "disabled");
    assert_eq!(client.charge_current().await.unwrap(), 32);

    let request = OverrideRequest {
        state: Some("active".into()),
        charge_current: Some(24),
        ..Default::default()
    };
    client.set_override(&request).await.unwrap();
    client.clear_override().await.unwrap();
    client.toggle_override().await.unwrap();

    assert_eq!(
        charger.calls_to("POST", "/override"),
        vec![json!({"state": "active", "charge_current": 24})]
    );
    assert_eq!(charger.calls_to("DELETE", "/override").len(), 1);
    assert_eq!(charger.calls_to("PATCH", "/override").len(), 1);
}

#[tokio::test]
async fn test_claims_and_limits() {
    let (client, charger) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    let claim = ClaimRequest {
        state: Some("disabled".into()),
        ..Default::default()
    };
    client.make_claim(&claim).await.unwrap();
    client.release_claim().await.unwrap();
    let claims = client.list_claims().await.unwrap();
    assert_eq!(claims[0]["client"], 20);

    let limit = LimitRequest {
        limit_type: "energy".into(),
        value: 5000,
        auto_release: None,
    };
    client.set_limit(&limit).await.unwrap();
    client.clear_limit().await.unwrap();

    assert_eq!(
        charger.calls_to("POST", "/claims/20"),
        vec![json!({"state": "disabled"})]
    );
    assert_eq!(charger.calls_to("DELETE", "/claims/20").len(), 1);
    assert_eq!(
        charger.calls_to("POST", "/limit"),
        vec![json!({"type": "energy", "value": 5000})]
    );
    assert_eq!(charger.calls_to("DELETE", "/limit").len(), 1);
}

#[tokio::test]
async fn test_sensor_feeds() {
    let (client, charger) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    client.self_production(Some(-200), None, false).await.unwrap();
    client.self_production(Some(4100), None, true).await.unwrap();
    client.self_production(None, Some(3000), false).await.unwrap();
    client.self_production(None, None, false).await.unwrap();
    client.grid_voltage(Some(238)).await.unwrap();
    client.grid_voltage(None).await.unwrap();
    client.set_shaper_live_pwr(Some(1500)).await.unwrap();

    assert_eq!(
        charger.calls_to("POST", "/status"),
        vec![
            json!({"grid_ie": -200}),
            json!({"grid_ie": -4100}),
            json!({"solar": 3000}),
            json!({"voltage": 238}),
            json!({"shaper_live_pwr": 1500}),
        ]
    );
}

#[tokio::test]
async fn test_divert_mode() {
    let (client, charger) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    client.set_divert_mode("eco").await.unwrap();
    assert_eq!(
        charger.calls_to("POST", "/divertmode"),
        vec![json!({"divertmode": "2"})]
    );
    assert!(matches!(
        client.set_divert_mode("turbo").await,
        Err(ClientError::InvalidField { .. })
    ));
}

#[tokio::test]
async fn test_firmware_check() {
    let (client, _) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    let release = client.firmware_check().await.unwrap();
    assert_eq!(release.latest_version, "4.1.8");
    assert_eq!(release.release_summary.chars().count(), 255);
    assert!(release.release_summary.ends_with(".."));
    assert!(release.release_url.ends_with("/v4.1.8"));
}

#[tokio::test]
async fn test_websocket_frames_merge_and_notify() {
    let (client, _) = spawn(Charger::new()).await;
    client.update().await.unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    client.set_callback(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    client.ws_start().unwrap();

    for _ in 0..100 {
        if hits.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(client.ws_state(), WsState::Connected);
    let readings = client.readings();
    assert_eq!(readings.state().unwrap(), "charging");
    assert_eq!(readings.charging_current().unwrap(), 16000.0);

    client.ws_disconnect().await;
    assert_eq!(client.ws_state(), WsState::Stopped);
}
