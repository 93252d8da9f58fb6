use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::Method;
use reqwest::RequestBuilder;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::debug;
use tracing::info;

use crate::error::ClientError;
use crate::readings::Readings;
use crate::requests::ClaimRequest;
use crate::requests::FirmwareRelease;
use crate::requests::Identity;
use crate::requests::LimitRequest;
use crate::requests::OverrideRequest;
use crate::websocket;
use crate::websocket::WsState;

/// Invoked after every websocket frame has been merged into the readings.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Claim slot used for every claim this client makes.
const CLAIM_CLIENT_ID: u32 = 20;

const ESP32_REPO: &str = "OpenEVSE/ESP32_WiFi_V4.x";
const ESP8266_REPO: &str = "OpenEVSE/ESP8266_WiFi_v2.x";

/// Maximum length of a release summary, in characters.
const RELEASE_SUMMARY_MAX: usize = 255;

const USER_AGENT: &str = concat!("openevse_http/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    /// Base URL of the GitHub-compatible releases API.
    pub release_api: String,
    pub reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
            release_api: "https://api.github.com".to_string(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

struct Inner {
    host: String,
    options: ClientOptions,
    http: reqwest::Client,
    readings: Arc<RwLock<Readings>>,
    ws_state: Arc<Mutex<WsState>>,
    ws_task: Mutex<Option<JoinHandle<()>>>,
    callback: Arc<Mutex<Option<Callback>>>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.ws_task).take() {
            task.abort();
        }
    }
}

/// Handle to one charger. Cheap to clone; all clones share the same
/// readings cache and websocket.
#[derive(Clone)]
pub struct OpenEvse {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OpenEvse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenEvse")
            .field("host", &self.inner.host)
            .field("ws_state", &self.ws_state())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OpenEvse {
    pub fn new(host: impl Into<String>, options: ClientOptions) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self {
            inner: Arc::new(Inner {
                host: host.into(),
                options,
                http,
                readings: Arc::new(RwLock::new(Readings::default())),
                ws_state: Arc::new(Mutex::new(WsState::Stopped)),
                ws_task: Mutex::new(None),
                callback: Arc::new(Mutex::new(None)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Base URL of the gateway's web UI.
    pub fn url(&self) -> String {
        format!("http://{}/", self.inner.host)
    }

    /// Snapshot of the last fetched readings.
    pub fn readings(&self) -> Readings {
        self.inner
            .readings
            .read()
            .map(|r| r.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn version_check(&self, min: &str) -> bool {
        self.readings().version_check(min)
    }

    fn require(&self, feature: &str, min: &str) -> Result<(), ClientError> {
        if self.version_check(min) {
            Ok(())
        } else {
            Err(ClientError::UnsupportedFeature(feature.to_string()))
        }
    }

    fn with_readings<R>(&self, f: impl FnOnce(&mut Readings) -> R) -> R {
        match self.inner.readings.write() {
            Ok(mut r) => f(&mut r),
            Err(e) => f(&mut e.into_inner()),
        }
    }

    // HTTP plumbing

    fn endpoint(&self, path: &str) -> String {
        format!("http://{}/{}", self.inner.host, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.inner.http.request(method, url);
        match self.inner.options.username.as_deref() {
            Some(user) if !user.is_empty() => {
                req.basic_auth(user, self.inner.options.password.as_deref())
            }
            _ => req,
        }
    }

    async fn send(&self, req: RequestBuilder, url: &str) -> Result<Value, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::AuthenticationFailed);
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // A few endpoints answer with a bare status line instead of JSON
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn get(&self, path: &str) -> Result<Value, ClientError> {
        let url = self.endpoint(path);
        debug!("GET {}", url);
        self.send(self.request(Method::GET, &url), &url).await
    }

    async fn delete(&self, path: &str) -> Result<Value, ClientError> {
        let url = self.endpoint(path);
        debug!("DELETE {}", url);
        self.send(self.request(Method::DELETE, &url), &url).await
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Value, ClientError> {
        let url = self.endpoint(path);
        debug!("{} {}", method, url);
        self.send(self.request(method, &url).json(body), &url).await
    }

    async fn get_object(&self, path: &str) -> Result<Map<String, Value>, ClientError> {
        match self.get(path).await? {
            Value::Object(map) => Ok(map),
            other => Err(ClientError::invalid(
                path,
                format!("expected an object, got {}", other),
            )),
        }
    }

    // Polling

    /// Refresh `/status` and `/config`.
    pub async fn update(&self) -> Result<(), ClientError> {
        let status = self.get_object("status").await?;
        let config = self.get_object("config").await?;
        self.with_readings(|r| *r = Readings::new(status, config));
        Ok(())
    }

    /// Read the serial number and hardware model from `/config`.
    pub async fn test_and_get(&self) -> Result<Identity, ClientError> {
        let config = self.get_object("config").await?;
        let status = self.readings().status_json().clone();
        let readings = Readings::new(status, config);

        let serial = readings.serial().ok_or(ClientError::MissingSerial)?;
        let model = readings.model();
        self.with_readings(|r| *r = readings);
        Ok(Identity { serial, model })
    }

    /// Send a raw RAPI command. Returns the echoed command and the reply.
    pub async fn send_command(&self, command: &str) -> Result<(String, String), ClientError> {
        let url = self.endpoint("r");
        let req = self
            .request(Method::GET, &url)
            .query(&[("json", "1"), ("rapi", command)]);
        let reply = self.send(req, &url).await?;

        let field = |key: &str| -> Result<String, ClientError> {
            reply
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ClientError::MissingField(key.to_string()))
        };
        Ok((field("cmd")?, field("ret")?))
    }

    // Overrides

    pub async fn get_override(&self) -> Result<Value, ClientError> {
        self.require("override", "4.0.0")?;
        match self.get("override").await {
            Err(ClientError::Status { status: 404, .. }) => Ok(json!({})),
            other => other,
        }
    }

    /// Current override state, `auto` when no override is active.
    pub async fn override_state(&self) -> Result<String, ClientError> {
        self.require("override_state", "4.1.0")?;
        let current = self.get_override().await?;
        Ok(current
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or("auto")
            .to_string())
    }

    pub async fn set_override(&self, request: &OverrideRequest) -> Result<Value, ClientError> {
        self.require("override", "4.0.0")?;
        request.validate()?;
        self.send_json(Method::POST, "override", request).await
    }

    pub async fn clear_override(&self) -> Result<Value, ClientError> {
        self.require("override", "4.0.0")?;
        self.delete("override").await
    }

    /// Flip the manual override. Old firmware has no override endpoint, so the
    /// EVSE is slept or woken directly.
    pub async fn toggle_override(&self) -> Result<(), ClientError> {
        if self.version_check("4.0.0") {
            self.send_json(Method::PATCH, "override", &json!({})).await?;
            return Ok(());
        }

        let command = if self.readings().state()? == "sleeping" {
            "$FE"
        } else {
            "$FS"
        };
        self.send_command(command).await?;
        Ok(())
    }

    // Charge current

    /// Effective charge current target.
    pub async fn charge_current(&self) -> Result<i64, ClientError> {
        let readings = self.readings();
        if !readings.version_check("4.1.0") {
            return readings.max_current_soft();
        }

        let target = self.get("claims/target").await?;
        match target.pointer("/properties/charge_current") {
            Some(v) => v
                .as_i64()
                .ok_or_else(|| ClientError::invalid("charge_current", v.to_string())),
            None => readings.current_capacity(),
        }
    }

    pub async fn set_current(&self, amps: i64) -> Result<(), ClientError> {
        self.require("set_current", "4.1.0")?;
        let readings = self.readings();
        let min = readings.min_amps().unwrap_or(6);
        let max = readings.max_amps().unwrap_or(48);
        if amps < min || amps > max {
            return Err(ClientError::OutOfRange {
                field: "max_current_soft".to_string(),
                value: amps,
                min,
                max,
            });
        }

        self.send_json(Method::POST, "config", &json!({"max_current_soft": amps}))
            .await?;
        self.with_readings(|r| r.set_config("max_current_soft", json!(amps)));
        Ok(())
    }

    // Solar divert

    pub async fn set_divert_mode(&self, mode: &str) -> Result<(), ClientError> {
        let code = match mode {
            "fast" => 1,
            "eco" => 2,
            other => {
                return Err(ClientError::invalid(
                    "divertmode",
                    format!("'{}' is not one of fast, eco", other),
                ));
            }
        };
        let url = self.endpoint("divertmode");
        let req = self
            .request(Method::POST, &url)
            .form(&[("divertmode", code.to_string())]);
        self.send(req, &url).await?;
        Ok(())
    }

    pub async fn set_divert_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        self.require("divert_enabled", "4.0.0")?;
        self.send_json(Method::POST, "config", &json!({"divert_enabled": enabled}))
            .await?;
        Ok(())
    }

    // LED

    pub async fn set_led_brightness(&self, level: u8) -> Result<(), ClientError> {
        self.require("led_brightness", "4.1.0")?;
        self.send_json(Method::POST, "config", &json!({"led_brightness": level}))
            .await?;
        self.with_readings(|r| r.set_config("led_brightness", json!(level)));
        Ok(())
    }

    // Restarts

    pub async fn restart_wifi(&self) -> Result<(), ClientError> {
        info!("Restarting WiFi gateway on {}", self.inner.host);
        self.send_json(Method::POST, "restart", &json!({"device": "gateway"}))
            .await?;
        Ok(())
    }

    pub async fn restart_evse(&self) -> Result<(), ClientError> {
        info!("Restarting EVSE module on {}", self.inner.host);
        if self.version_check("4.1.0") {
            self.send_json(Method::POST, "restart", &json!({"device": "evse"}))
                .await?;
        } else {
            self.send_command("$FR").await?;
        }
        Ok(())
    }

    // Claims

    pub async fn make_claim(&self, request: &ClaimRequest) -> Result<Value, ClientError> {
        self.require("claims", "4.1.0")?;
        request.validate()?;
        let path = format!("claims/{}", CLAIM_CLIENT_ID);
        self.send_json(Method::POST, &path, request).await
    }

    pub async fn release_claim(&self) -> Result<Value, ClientError> {
        self.require("claims", "4.1.0")?;
        self.delete(&format!("claims/{}", CLAIM_CLIENT_ID)).await
    }

    pub async fn list_claims(&self) -> Result<Value, ClientError> {
        self.require("claims", "4.1.0")?;
        self.get("claims").await
    }

    // Limits

    pub async fn set_limit(&self, request: &LimitRequest) -> Result<Value, ClientError> {
        self.require("limit", "4.0.0")?;
        request.validate()?;
        self.send_json(Method::POST, "limit", request).await
    }

    pub async fn get_limit(&self) -> Result<Value, ClientError> {
        self.require("limit", "4.0.0")?;
        match self.get("limit").await {
            Err(ClientError::Status { status: 404, .. }) => Ok(json!({})),
            other => other,
        }
    }

    pub async fn clear_limit(&self) -> Result<Value, ClientError> {
        self.require("limit", "4.0.0")?;
        self.delete("limit").await
    }

    // External sensor feeds

    /// Feed grid import/export or solar production into the divert logic.
    /// With `invert`, the grid reading is negated before sending.
    pub async fn self_production(
        &self,
        grid: Option<i64>,
        solar: Option<i64>,
        invert: bool,
    ) -> Result<(), ClientError> {
        self.require("self_production", "4.0.0")?;
        let body = match (grid, solar) {
            (Some(g), _) => {
                let g = if invert { -g } else { g };
                json!({ "grid_ie": g })
            }
            (None, Some(s)) => json!({"solar": s}),
            (None, None) => {
                debug!("No grid or solar reading to send");
                return Ok(());
            }
        };
        self.send_json(Method::POST, "status", &body).await?;
        Ok(())
    }

    pub async fn grid_voltage(&self, voltage: Option<i64>) -> Result<(), ClientError> {
        self.require("grid_voltage", "4.0.0")?;
        let Some(voltage) = voltage else {
            debug!("No voltage reading to send");
            return Ok(());
        };
        self.send_json(Method::POST, "status", &json!({"voltage": voltage}))
            .await?;
        Ok(())
    }

    pub async fn set_shaper_live_pwr(&self, power: Option<i64>) -> Result<(), ClientError> {
        self.require("shaper", "4.0.0")?;
        let Some(power) = power else {
            debug!("No shaper reading to send");
            return Ok(());
        };
        self.send_json(Method::POST, "status", &json!({"shaper_live_pwr": power}))
            .await?;
        Ok(())
    }

    // Firmware

    /// Look up the latest upstream release for this gateway's hardware family.
    pub async fn firmware_check(&self) -> Result<FirmwareRelease, ClientError> {
        let version = self.readings().firmware_version()?;
        let repo = match version.major() {
            Some(major) if major < 4 => ESP8266_REPO,
            _ => ESP32_REPO,
        };

        let url = format!(
            "{}/repos/{}/releases/latest",
            self.inner.options.release_api.trim_end_matches('/'),
            repo
        );
        debug!("Checking for firmware updates at {}", url);
        let release = self
            .send(self.inner.http.get(&url), &url)
            .await?;

        let field = |key: &str| -> String {
            release
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let tag = field("tag_name");
        if tag.is_empty() {
            return Err(ClientError::MissingField("tag_name".to_string()));
        }

        Ok(FirmwareRelease {
            latest_version: tag.trim_start_matches('v').to_string(),
            release_summary: truncate_summary(&field("body")),
            release_url: field("html_url"),
        })
    }

    // Websocket

    pub fn ws_state(&self) -> WsState {
        *lock(&self.inner.ws_state)
    }

    pub fn set_callback(&self, callback: Callback) {
        *lock(&self.inner.callback) = Some(callback);
    }

    /// Start (or restart a dropped) push channel. A live connection is left alone.
    ///
    /// Fails with a transient error when called outside a tokio runtime or
    /// after `close`, and with `InvalidUrl` when the host cannot form a
    /// websocket URL.
    pub fn ws_start(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let runtime = Handle::try_current().map_err(|e| ClientError::Websocket(e.to_string()))?;
        let url = self.ws_url();
        if let Err(e) = url.as_str().into_client_request() {
            return Err(ClientError::InvalidUrl {
                url,
                reason: e.to_string(),
            });
        }

        let mut task = lock(&self.inner.ws_task);
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() && self.ws_state() != WsState::Disconnected {
                return Ok(());
            }
        }
        if let Some(handle) = task.take() {
            handle.abort();
        }

        let readings = self.inner.readings.clone();
        let callback = self.inner.callback.clone();
        let on_frame = move |frame: Map<String, Value>| {
            match readings.write() {
                Ok(mut r) => r.merge_status(frame),
                Err(e) => e.into_inner().merge_status(frame),
            }
            let cb = lock(&callback).clone();
            if let Some(cb) = cb {
                cb();
            }
        };

        *task = Some(runtime.spawn(websocket::run(
            url,
            self.inner.ws_state.clone(),
            self.inner.options.reconnect_delay,
            on_frame,
        )));
        Ok(())
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.inner.host)
    }

    pub async fn ws_disconnect(&self) {
        if let Some(handle) = lock(&self.inner.ws_task).take() {
            handle.abort();
        }
        websocket::set_state(&self.inner.ws_state, WsState::Stopped);
        debug!("Websocket to {} stopped", self.inner.host);
    }

    /// Stop the websocket and refuse every later request with `Closed`.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.ws_disconnect().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

fn truncate_summary(body: &str) -> String {
    if body.chars().count() > RELEASE_SUMMARY_MAX {
        let head: String = body.chars().take(RELEASE_SUMMARY_MAX - 2).collect();
        format!("{}..", head)
    } else {
        body.to_string()
    }
}
