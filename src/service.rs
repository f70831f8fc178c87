/* Collaborator contracts: registration/connect decisions (HandheldManager) and
 * the chat-service side of the login/session dialogue (Service). Both run
 * synchronously on the driver's event-loop task, so implementations must
 * return promptly or post work back through the driver handle. */

use std::collections::HashMap;

use async_trait::async_trait;

use crate::handheld::Handheld;
use crate::packets::ToneEvent;
use crate::rtttl::Ringtone;

/* Data an application supplies for a connecting handheld. */
#[derive(Debug, Clone)]
pub struct HandheldConnectData {
    /* Name shown on the handheld's screen. */
    pub name: String,
    /* Event tones; missing entries fall back to the mute tone. */
    pub tones: HashMap<ToneEvent, Ringtone>,
}

impl HandheldConnectData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tones: HashMap::new(),
        }
    }
}

#[async_trait]
pub trait HandheldManager: Send {
    /* A user is holding the register button on a new handheld. Returns
     * whether the registration is accepted. */
    async fn register(&mut self, handheld_id: &str) -> bool;

    /* A handheld is connecting. `None` refuses the connection. */
    async fn connect(&mut self, handheld_id: &str) -> Option<HandheldConnectData>;
}

#[async_trait]
pub trait Service: Send {
    /* Six-character label shown on the handheld. The second character selects
     * the network family on the firmware ('A', 'a' or 'M'). */
    fn service_id(&self) -> String {
        " AIM  ".to_string()
    }

    async fn login(&mut self, handheld: &Handheld) -> bool;

    async fn logout(&mut self);

    /* Fired 500 ms after a successful login, once the handheld is ready for
     * traffic. */
    async fn ready(&mut self, handheld: &Handheld);

    /* A fully reassembled message typed on the handheld. */
    async fn message(&mut self, handheld: &Handheld, text: &str) {
        let _ = (handheld, text);
    }

    /* The user set an away message. */
    async fn away(&mut self, handheld: &Handheld, text: &str) {
        let _ = (handheld, text);
    }
}
