use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use openevse_http::ClientError;
use openevse_http::FirmwareRelease;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::charger::Charger;

/// Latest upstream release, as last fetched.
#[derive(Debug, Clone, Default)]
pub struct FirmwareState {
    pub release: Option<FirmwareRelease>,
    pub last_update_success: bool,
}

type Listener = Box<dyn Fn() + Send + Sync>;

/// Slow poll of the upstream release feed, independent of the main cache.
pub struct FirmwareCoordinator {
    charger: Arc<dyn Charger>,
    state: Mutex<FirmwareState>,
    listeners: Mutex<Vec<Listener>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FirmwareCoordinator {
    pub fn new(charger: Arc<dyn Charger>) -> Arc<Self> {
        Arc::new(Self {
            charger,
            state: Mutex::new(FirmwareState::default()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> FirmwareState {
        lock(&self.state).clone()
    }

    pub fn add_listener(&self, listener: Listener) {
        lock(&self.listeners).push(listener);
    }

    pub fn clear_listeners(&self) {
        lock(&self.listeners).clear();
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        let result = self.charger.firmware_check().await;
        {
            let mut state = lock(&self.state);
            match &result {
                Ok(release) => {
                    debug!("FW Update: {:?}", release);
                    state.release = Some(release.clone());
                    state.last_update_success = true;
                }
                Err(err) => {
                    warn!("Firmware check for {} failed: {}", self.charger.host(), err);
                    state.last_update_success = false;
                }
            }
        }

        // Listeners read the main coordinator, so they run outside our lock
        for listener in lock(&self.listeners).iter() {
            listener();
        }
        result.map(|_| ())
    }
}

/// Model and software version for the device registry.
pub async fn get_firmware(charger: &dyn Charger) -> (String, String) {
    if let Err(err) = charger.update().await {
        error!("Problem retreiving firmware data: {}", err);
        return (String::new(), String::new());
    }

    let readings = charger.readings();
    let wifi_firmware = readings.wifi_firmware().unwrap_or_default();
    let model = match charger.test_and_get().await {
        Ok(identity) => Some(identity.model),
        Err(ClientError::MissingSerial) => {
            info!("Missing serial number data, skipping...");
            None
        }
        Err(err) => {
            warn!("Could not read hardware model: {}", err);
            None
        }
    };

    match model {
        Some(model) if model != "unknown" => (model, wifi_firmware),
        _ => (
            format!("Wifi version {}", wifi_firmware),
            readings.openevse_firmware().unwrap_or_default(),
        ),
    }
}
