//! Shared attribute cache for one charger.
//!
//! The cache is rebuilt by the poll timer and by every websocket frame. Each
//! rebuild takes a sequence number when it snapshots the readings; a rebuild
//! whose sequence is older than the published one is dropped, so a slow poll
//! can never overwrite fresher pushed data.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use openevse_http::ClientError;
use openevse_http::Readings;
use openevse_http::WsState;
use serde_json::Map;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::accessor::Accessor;
use super::accessor::truthy;
use super::charger::Charger;
use super::descriptions::ParsedTable;
use super::descriptions::parsed_tables;

pub type Data = Map<String, Value>;

/// Published state of the cache.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub version: u64,
    pub data: Arc<Data>,
    pub last_update_success: bool,
}

impl Snapshot {
    /// Cached value for a key. `null` counts as absent.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|v| !v.is_null())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f.round() as i64))
        })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Error)]
#[error("Error communicating with charger: {0}")]
pub struct UpdateFailed(#[from] pub ClientError);

pub type Listener = Box<dyn Fn(&Snapshot) + Send + Sync>;

struct Inner {
    published: Snapshot,
    next_seq: u64,
    /// Last values fetched through their own request
    async_values: Data,
}

pub struct Coordinator {
    name: String,
    charger: Arc<dyn Charger>,
    tables: Vec<ParsedTable>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Listener>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn error_kind(err: &ClientError) -> &'static str {
    match err {
        ClientError::Http(_) => "Http",
        ClientError::Timeout { .. } => "Timeout",
        ClientError::Status { .. } => "Status",
        ClientError::AuthenticationFailed => "AuthenticationFailed",
        ClientError::Json(_) => "Json",
        ClientError::MissingField(_) => "MissingField",
        ClientError::InvalidField { .. } => "InvalidField",
        ClientError::UnsupportedFeature(_) => "UnsupportedFeature",
        ClientError::MissingSerial => "MissingSerial",
        ClientError::OutOfRange { .. } => "OutOfRange",
        ClientError::Websocket(_) => "Websocket",
        ClientError::InvalidUrl { .. } => "InvalidUrl",
        ClientError::Closed => "Closed",
    }
}

impl Coordinator {
    /// Create a coordinator and hook it up to the charger's push channel.
    pub fn new(name: impl Into<String>, charger: Arc<dyn Charger>) -> Arc<Self> {
        Self::with_tables(name, charger, parsed_tables())
    }

    fn with_tables(
        name: impl Into<String>,
        charger: Arc<dyn Charger>,
        tables: Vec<ParsedTable>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            name: name.into(),
            charger: charger.clone(),
            tables,
            inner: Mutex::new(Inner {
                published: Snapshot::default(),
                next_seq: 0,
                async_values: Data::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&coordinator);
        charger.set_callback(Arc::new(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.websocket_update();
            }
        }));
        coordinator
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> Snapshot {
        lock(&self.inner).published.clone()
    }

    pub fn last_update_success(&self) -> bool {
        lock(&self.inner).published.last_update_success
    }

    /// Register a listener. Listeners run after every accepted write, in
    /// registration order, and always see the newest published cache. They
    /// may read the coordinator but must not trigger a rebuild.
    pub fn add_listener(&self, listener: Listener) {
        lock(&self.listeners).push(listener);
    }

    pub fn clear_listeners(&self) {
        lock(&self.listeners).clear();
    }

    /// Poll the charger and publish a fresh cache.
    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        if let Err(err) = self.fetch().await {
            debug!("Error updating sensors [{}]: {}", error_kind(&err), err);
            let accepted = {
                let mut inner = lock(&self.inner);
                let seq = Self::begin(&mut inner);
                let data = inner.published.data.clone();
                self.publish(&mut inner, seq, data, false)
            };
            if accepted {
                self.notify();
            }
            return Err(UpdateFailed(err));
        }

        let (seq, readings) = {
            let mut inner = lock(&self.inner);
            (Self::begin(&mut inner), self.charger.readings())
        };
        let async_values = self.parse_async().await;
        if self.commit(seq, &readings, async_values) {
            self.notify();
        }
        Ok(())
    }

    /// Publish a polled rebuild. The async values are only remembered when
    /// the rebuild is not stale.
    fn commit(&self, seq: u64, readings: &Readings, async_values: Data) -> bool {
        let mut data = self.parse_sync(readings);
        data.extend(async_values.clone());

        let mut inner = lock(&self.inner);
        let accepted = self.publish(&mut inner, seq, Arc::new(data), true);
        if accepted {
            inner.async_values = async_values;
        }
        accepted
    }

    /// Push path, invoked for every websocket frame.
    pub fn websocket_update(&self) {
        debug!("Websocket update!");
        self.rebuild();
    }

    /// Rebuild from the current readings without any I/O. Never dropped as
    /// stale since the snapshot and the publish happen under one lock.
    pub fn rebuild(&self) {
        {
            let mut inner = lock(&self.inner);
            let seq = Self::begin(&mut inner);
            let readings = self.charger.readings();
            let mut data = self.parse_sync(&readings);
            data.extend(inner.async_values.clone());
            self.publish(&mut inner, seq, Arc::new(data), true);
        }
        self.notify();
    }

    async fn fetch(&self) -> Result<(), ClientError> {
        match self.charger.update().await {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                debug!("Transient error updating {}: {}", self.name, err);
            }
            Err(err) => return Err(err),
        }

        if self.charger.ws_state() == WsState::Disconnected {
            debug!("Websocket for {} is disconnected, restarting", self.name);
            match self.charger.ws_start() {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    debug!("Transient error restarting websocket for {}: {}", self.name, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn begin(inner: &mut Inner) -> u64 {
        inner.next_seq += 1;
        inner.next_seq
    }

    /// Returns false when the write was stale and dropped.
    fn publish(&self, inner: &mut Inner, seq: u64, data: Arc<Data>, success: bool) -> bool {
        if seq <= inner.published.version {
            debug!(
                "Dropping stale update {} for {} (published {})",
                seq, self.name, inner.published.version
            );
            return false;
        }

        inner.published = Snapshot {
            version: seq,
            data,
            last_update_success: success,
        };
        true
    }

    /// Run the listeners once. Called with the cache unlocked; the listener
    /// lock serializes notifications so the last one carries the newest cache.
    fn notify(&self) {
        let listeners = lock(&self.listeners);
        let snapshot = self.snapshot();
        for listener in listeners.iter() {
            listener(&snapshot);
        }
    }

    /// Later tables overwrite keys set by earlier ones.
    fn parse_sync(&self, readings: &Readings) -> Data {
        let mut data = Data::new();
        for table in &self.tables {
            for attribute in &table.attributes {
                let Accessor::Sync(read) = attribute.accessor() else {
                    continue;
                };
                let key = attribute.key();
                match read(readings) {
                    Ok(value) if table.binary => {
                        data.insert(key.to_string(), Value::Bool(truthy(&value)));
                    }
                    Ok(value) => {
                        data.insert(key.to_string(), value);
                    }
                    Err(err) if table.suppress.covers(&err) => {
                        info!("Could not update status for {}", key);
                    }
                    Err(err) => {
                        warn!("Could not update status for {}: {}", key, err);
                    }
                }
            }
        }
        data
    }

    async fn parse_async(&self) -> Data {
        let mut data = Data::new();
        for table in &self.tables {
            for attribute in &table.attributes {
                let Accessor::Async(read) = attribute.accessor() else {
                    continue;
                };
                let key = attribute.key();
                match read.read(self.charger.as_ref()).await {
                    Ok(value) => {
                        data.insert(key.to_string(), value);
                    }
                    Err(err) if table.suppress.covers(&err) => {
                        info!("Could not update status for {}", key);
                    }
                    Err(err) => {
                        warn!("Could not update status for {}: {}", key, err);
                    }
                }
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::integrations::openevse::accessor::Attribute;
    use crate::integrations::openevse::accessor::Suppress;
    use crate::integrations::openevse::charger::Call;
    use crate::integrations::openevse::charger::MockCharger;
    use crate::integrations::openevse::charger::MockFailure;

    fn counting(coordinator: &Coordinator) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        coordinator.add_listener(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[tokio::test]
    async fn test_refresh_caches_every_readable_value() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());

        coordinator.refresh().await.unwrap();
        let snapshot = coordinator.snapshot();

        assert!(snapshot.last_update_success);
        assert_eq!(snapshot.get("state"), Some(&json!("sleeping")));
        assert_eq!(snapshot.get("usage_total"), Some(&json!(64.582)));
        assert_eq!(snapshot.get("max_amps"), Some(&json!(48)));
        assert_eq!(snapshot.get("divertmode"), Some(&json!("fast")));
        assert_eq!(snapshot.get("vehicle"), Some(&json!(true)));
        assert_eq!(snapshot.get("override_state"), Some(&json!("auto")));
        assert_eq!(snapshot.get("max_current_soft"), Some(&json!(32)));
        assert_eq!(snapshot.get("led_brightness"), Some(&json!(125)));
        // Absent optional readings stay in the cache as null
        assert_eq!(snapshot.data.get("ir_temperature"), Some(&Value::Null));
        assert_eq!(snapshot.get("ir_temperature"), None);
    }

    #[tokio::test]
    async fn test_failed_reads_are_isolated() {
        let mock = MockCharger::fixture();
        mock.remove_config("max_current_hard");
        mock.set_status("voltage", json!("n/a"));
        let coordinator = Coordinator::new("openevse", mock.clone());

        coordinator.refresh().await.unwrap();
        let snapshot = coordinator.snapshot();

        assert!(!snapshot.data.contains_key("max_amps"));
        assert!(!snapshot.data.contains_key("charging_voltage"));
        assert!(!snapshot.data.contains_key("charging_power"));
        assert_eq!(snapshot.get("min_amps"), Some(&json!(6)));
        assert_eq!(snapshot.get("charging_current"), Some(&json!(0.0)));
    }

    #[tokio::test]
    async fn test_unsupported_features_are_omitted() {
        let mock = MockCharger::fixture();
        mock.set_config("version", json!("4.0.1"));
        mock.set_override_state(None);
        let coordinator = Coordinator::new("openevse", mock.clone());

        coordinator.refresh().await.unwrap();
        let snapshot = coordinator.snapshot();

        assert!(!snapshot.data.contains_key("has_limit"));
        assert!(!snapshot.data.contains_key("led_brightness"));
        assert!(!snapshot.data.contains_key("override_state"));
        assert_eq!(snapshot.get("shaper_active"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_transient_errors_are_swallowed() {
        let mock = MockCharger::fixture();
        mock.fail_update(Some(MockFailure::Transient));
        let coordinator = Coordinator::new("openevse", mock.clone());

        coordinator.refresh().await.unwrap();
        assert!(coordinator.last_update_success());
        assert_eq!(coordinator.snapshot().get("state"), Some(&json!("sleeping")));
    }

    #[tokio::test]
    async fn test_other_errors_fail_the_refresh() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());
        coordinator.refresh().await.unwrap();
        let count = counting(&coordinator);

        mock.fail_update(Some(MockFailure::Status));
        let err = coordinator.refresh().await.unwrap_err();

        assert!(matches!(err.0, ClientError::Status { status: 500, .. }));
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.last_update_success);
        // Last good data is kept
        assert_eq!(snapshot.get("state"), Some(&json!("sleeping")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnected_websocket_is_restarted() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());

        mock.set_ws_state(WsState::Connected);
        coordinator.refresh().await.unwrap();
        assert!(!mock.calls().contains(&Call::WsStart));

        mock.set_ws_state(WsState::Disconnected);
        coordinator.refresh().await.unwrap();
        assert!(mock.calls().contains(&Call::WsStart));
    }

    #[tokio::test]
    async fn test_websocket_start_errors() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());
        mock.set_ws_state(WsState::Disconnected);

        mock.fail_ws_start(Some(MockFailure::Transient));
        coordinator.refresh().await.unwrap();
        assert!(coordinator.last_update_success());
        assert_eq!(coordinator.snapshot().get("state"), Some(&json!("sleeping")));

        mock.fail_ws_start(Some(MockFailure::Status));
        let err = coordinator.refresh().await.unwrap_err();
        assert!(matches!(err.0, ClientError::Status { .. }));
        assert!(!coordinator.last_update_success());
        assert_eq!(
            mock.calls().iter().filter(|c| **c == Call::WsStart).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_later_tables_win() {
        let mock = MockCharger::fixture();
        let table = |name, binary| ParsedTable {
            name,
            attributes: vec![Attribute::Divertmode],
            suppress: Suppress::ReadErrors,
            binary,
        };

        let coordinator = Coordinator::with_tables(
            "openevse",
            mock.clone(),
            vec![table("sensor", false), table("binary_sensor", true)],
        );
        coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.snapshot().get("divertmode"), Some(&json!(true)));

        let coordinator = Coordinator::with_tables(
            "openevse",
            mock.clone(),
            vec![table("binary_sensor", true), table("select", false)],
        );
        coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.snapshot().get("divertmode"), Some(&json!("fast")));
    }

    #[tokio::test]
    async fn test_listener_can_read_coordinator() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&coordinator);
        let log = seen.clone();
        coordinator.add_listener(Box::new(move |_| {
            if let Some(coordinator) = weak.upgrade() {
                let version = coordinator.snapshot().version;
                lock(&log).push(version);
            }
        }));

        coordinator.refresh().await.unwrap();
        coordinator.websocket_update();
        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_websocket_update_notifies_once() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());
        coordinator.refresh().await.unwrap();
        let count = counting(&coordinator);

        mock.push_frame(json!({"state": 3, "amp": 16000}));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.get("state"), Some(&json!("charging")));
        assert_eq!(snapshot.get("charging_current"), Some(&json!(16000.0)));
        // Async values survive a push rebuild
        assert_eq!(snapshot.get("override_state"), Some(&json!("auto")));
        assert_eq!(snapshot.get("max_current_soft"), Some(&json!(32)));

        mock.push_frame(json!({"state": 254}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_writes_are_dropped() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());
        let count = counting(&coordinator);

        let stale = take_sequence(&coordinator);
        coordinator.websocket_update();
        let version = coordinator.snapshot().version;

        let mut inner = lock(&coordinator.inner);
        let accepted = coordinator.publish(&mut inner, stale, Arc::new(Data::new()), true);
        drop(inner);

        assert!(!accepted);
        assert_eq!(coordinator.snapshot().version, version);
        assert!(coordinator.snapshot().get("state").is_some());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_refresh_keeps_async_values() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());

        let stale = take_sequence(&coordinator);
        coordinator.refresh().await.unwrap();
        let count = counting(&coordinator);

        let mut outdated = Data::new();
        outdated.insert("override_state".to_string(), json!("disabled"));
        assert!(!coordinator.commit(stale, &mock.readings(), outdated));
        assert_eq!(
            lock(&coordinator.inner).async_values.get("override_state"),
            Some(&json!("auto"))
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);

        coordinator.websocket_update();
        assert_eq!(
            coordinator.snapshot().get("override_state"),
            Some(&json!("auto"))
        );
    }

    fn take_sequence(coordinator: &Coordinator) -> u64 {
        Coordinator::begin(&mut lock(&coordinator.inner))
    }

    #[tokio::test]
    async fn test_dropping_coordinator_detaches_callback() {
        let mock = MockCharger::fixture();
        let coordinator = Coordinator::new("openevse", mock.clone());
        drop(coordinator);

        // Nothing to call back into; must not panic
        mock.push_frame(json!({"state": 3}));
    }
}
