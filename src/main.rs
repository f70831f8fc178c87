/* mx240a-rs entrypoint: sets up tracing, loads the handheld registry, opens the
 * base station, and runs the driver loop with the demo echo collaborators. */
mod base;
mod driver;
mod error;
mod handheld;
mod packets;
mod rtttl;
mod service;
mod transport;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::driver::{Driver, DriverHandle};
use crate::handheld::Handheld;
use crate::packets::ToneEvent;
use crate::rtttl::Ringtone;
use crate::service::{HandheldConnectData, HandheldManager, Service};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting mx240a-rs version {}", env!("CARGO_PKG_VERSION"));

    let registry_path = PathBuf::from(
        std::env::var("MX240A_REGISTRY").unwrap_or_else(|_| "handhelds.json".to_string()),
    );
    let manager = RegistryManager::load(&registry_path);

    let echo = EchoService::new();
    let handle_slot = echo.handle_slot();

    let driver = Driver::open(Box::new(manager), Box::new(echo)).await?;
    let handle = driver.handle();
    *handle_slot.lock().await = Some(handle.clone());

    /* Ctrl-C posts a shutdown command; the loop sends the shutdown frame on
     * its way out. */
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Caught interrupt, exiting...");
            handle.shutdown().await;
        }
    });

    driver.run().await
}

/* Handheld registry persisted as JSON. Registration is accepted for any
 * handheld and remembered across runs. */
#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    handhelds: HashMap<String, String>,
}

struct RegistryManager {
    path: PathBuf,
    registry: Registry,
}

impl RegistryManager {
    fn load(path: &Path) -> Self {
        let registry = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Ignoring malformed registry {:?}: {}", path, e);
                Registry::default()
            }),
            Err(_) => Registry::default(),
        };
        info!("Loaded {} registered handheld(s)", registry.handhelds.len());
        Self {
            path: path.to_path_buf(),
            registry,
        }
    }

    fn save(&self) {
        match serde_json::to_string_pretty(&self.registry) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!("Failed to write registry {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("Failed to serialize registry: {}", e),
        }
    }

    /* The tone set the IMFree handhelds shipped with. */
    fn default_tones() -> HashMap<ToneEvent, Ringtone> {
        [
            (ToneEvent::NewMessage, "Dang:d=4,o=5,b=140:16g#5,16e5,16c#5"),
            (
                ToneEvent::ContactOnline,
                "Rikasmiesjos:d=4,o=5,b=100:32b,32d6,32g6,32g6",
            ),
            (ToneEvent::ContactOffline, "Bolero:d=4,o=5,b=80:c6"),
            (ToneEvent::MessageSent, "Dang:d=4,o=5,b=140:16b5,16e5,16g#5"),
            (
                ToneEvent::ServiceDisconnected,
                "Dang:d=16,o=6,b=200:c,e,d7,c,e,a#,c,e",
            ),
            (ToneEvent::ServiceConnected, "Bulletme:d=4,o=5,b=112:b.5,g.5"),
            (ToneEvent::OutOfRange, "Dang:d=4,o=5,b=140:4c,8g,8g,8a,4g,2b,c"),
            (
                ToneEvent::BackInRange,
                "Dang:d=32,o=7,b=180:d#,e,g,d#,g,d#,f#,e",
            ),
            (ToneEvent::EnterSleepMode, "Dang:d=4,o=5,b=80:8e,8c,4f,4e,4d,4c"),
        ]
        .into_iter()
        .map(|(event, tone)| (event, Ringtone::parse_or_muted(tone)))
        .collect()
    }
}

#[async_trait]
impl HandheldManager for RegistryManager {
    async fn register(&mut self, handheld_id: &str) -> bool {
        info!("Registering handheld {}", handheld_id);
        self.registry
            .handhelds
            .insert(handheld_id.to_string(), "IMFree".to_string());
        self.save();
        true
    }

    async fn connect(&mut self, handheld_id: &str) -> Option<HandheldConnectData> {
        let name = match self.registry.handhelds.get(handheld_id) {
            Some(name) => name.clone(),
            None => {
                info!(
                    "Handheld {} not in registry; connecting with defaults",
                    handheld_id
                );
                "IMFree".to_string()
            }
        };
        let mut data = HandheldConnectData::new(name);
        data.tones = Self::default_tones();
        Some(data)
    }
}

/* Echo service: accepts every login, adds one buddy, and repeats messages back
 * to whichever window is open. The driver handle is filled in after the driver
 * is constructed. */
struct EchoService {
    handle: Arc<Mutex<Option<DriverHandle>>>,
}

impl EchoService {
    fn new() -> Self {
        Self {
            handle: Arc::new(Mutex::new(None)),
        }
    }

    fn handle_slot(&self) -> Arc<Mutex<Option<DriverHandle>>> {
        self.handle.clone()
    }
}

#[async_trait]
impl Service for EchoService {
    async fn login(&mut self, handheld: &Handheld) -> bool {
        info!(
            "Handheld {} logging in as {:?} (password {} chars)",
            handheld.handheld_id,
            handheld.username.as_deref().unwrap_or(""),
            handheld.password.as_deref().map_or(0, str::len)
        );
        true
    }

    async fn logout(&mut self) {
        info!("Handheld logged out");
    }

    async fn ready(&mut self, handheld: &Handheld) {
        info!("Handheld {} ready", handheld.connection_id);
        if let Some(handle) = self.handle.lock().await.clone() {
            handle.add_buddy(handheld.connection_id, "Echo", "Group").await;
        }
    }

    async fn message(&mut self, handheld: &Handheld, text: &str) {
        info!("Handheld {} says: {:?}", handheld.connection_id, text);
        let Some(window_id) = handheld.window() else {
            return;
        };
        if let Some(handle) = self.handle.lock().await.clone() {
            handle
                .send_message(handheld.connection_id, window_id, text, None)
                .await;
        }
    }

    async fn away(&mut self, handheld: &Handheld, text: &str) {
        info!("Handheld {} away: {:?}", handheld.connection_id, text);
    }
}
