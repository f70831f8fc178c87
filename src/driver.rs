/* Driver façade: owns the base-station session, the seven connection slots,
 * the deferred-task list, and the event loop tying packet dispatch, command
 * processing, and the polling cadence together. Collaborator callbacks run
 * synchronously on the loop; no handler runs concurrently with another. */

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::base::Base;
use crate::handheld::{Buddy, ConnectionState, Handheld, MAX_CONNECTIONS};
use crate::packets::{ErrorCode, FRAME_CONTINUE, RxPacket, ToneEvent, TxPacket};
use crate::rtttl::Ringtone;
use crate::service::{HandheldManager, Service};

/* Polling cadence: fast while any handheld is connected, relaxed when idle. */
const POLL_INTERVAL_ACTIVE: Duration = Duration::from_millis(500);
const POLL_INTERVAL_IDLE: Duration = Duration::from_millis(3000);

/* Service::ready fires this long after a successful login. */
const READY_DELAY_MS: u64 = 500;

/* A tick that takes longer than this points at an I/O stall. */
const TICK_OVERRUN: Duration = Duration::from_millis(20);

const COMMAND_BUFFER: usize = 16;

/* Commands collaborators post into the event loop. */
#[derive(Debug)]
pub enum DriverCommand {
    /* Deliver a message to a window on a handheld's screen. `from` switches
     * to group-chat framing with the sender's name in the payload. */
    SendMessage {
        connection_id: u8,
        window_id: u8,
        text: String,
        from: Option<String>,
    },
    AddBuddy {
        connection_id: u8,
        screen_name: String,
        group: String,
    },
    SetBuddyStatus {
        connection_id: u8,
        screen_name: String,
        idle: bool,
        mobile: bool,
        away: bool,
    },
    RunLater {
        delay_ms: u64,
        command: Box<DriverCommand>,
    },
    Shutdown,
}

/* Handle used by collaborators to reach the driver loop. */
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverCommand>,
}

impl DriverHandle {
    pub async fn send_message(
        &self,
        connection_id: u8,
        window_id: u8,
        text: &str,
        from: Option<&str>,
    ) {
        let _ = self
            .tx
            .send(DriverCommand::SendMessage {
                connection_id,
                window_id,
                text: text.to_string(),
                from: from.map(str::to_string),
            })
            .await;
    }

    pub async fn add_buddy(&self, connection_id: u8, screen_name: &str, group: &str) {
        let _ = self
            .tx
            .send(DriverCommand::AddBuddy {
                connection_id,
                screen_name: screen_name.to_string(),
                group: group.to_string(),
            })
            .await;
    }

    #[allow(dead_code)]
    pub async fn set_buddy_status(
        &self,
        connection_id: u8,
        screen_name: &str,
        idle: bool,
        mobile: bool,
        away: bool,
    ) {
        let _ = self
            .tx
            .send(DriverCommand::SetBuddyStatus {
                connection_id,
                screen_name: screen_name.to_string(),
                idle,
                mobile,
                away,
            })
            .await;
    }

    /* Run a command on the loop after at least `delay_ms` milliseconds. */
    #[allow(dead_code)]
    pub async fn run_later(&self, delay_ms: u64, command: DriverCommand) {
        let _ = self
            .tx
            .send(DriverCommand::RunLater {
                delay_ms,
                command: Box::new(command),
            })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(DriverCommand::Shutdown).await;
    }
}

/* What a deferred task does once its deadline passes. */
enum DeferredAction {
    ServiceReady { connection_id: u8 },
    Command(DriverCommand),
}

struct DeferredTask {
    remaining_ms: i64,
    action: DeferredAction,
}

pub struct Driver {
    base: Base,
    manager: Box<dyn HandheldManager>,
    service: Box<dyn Service>,
    /* Slot 0 is never assigned; connection ids index directly. */
    connections: [Option<Handheld>; MAX_CONNECTIONS + 1],
    num_connections: usize,
    deferred: Vec<DeferredTask>,
    ping_timer: Duration,
    last_tick: Instant,
    rx: mpsc::Receiver<DriverCommand>,
    tx: mpsc::Sender<DriverCommand>,
    shutdown: bool,
}

impl Driver {
    /* Open the base station and wire up the collaborators. */
    pub async fn open(
        manager: Box<dyn HandheldManager>,
        service: Box<dyn Service>,
    ) -> Result<Self> {
        Ok(Self::new(Base::open().await?, manager, service))
    }

    pub fn new(
        base: Base,
        manager: Box<dyn HandheldManager>,
        service: Box<dyn Service>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        Self {
            base,
            manager,
            service,
            connections: Default::default(),
            num_connections: 0,
            deferred: Vec::new(),
            ping_timer: Duration::ZERO,
            last_tick: Instant::now(),
            rx,
            tx,
            shutdown: false,
        }
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            tx: self.tx.clone(),
        }
    }

    /* Run until a Shutdown command or a fatal transport error; the shutdown
     * frame goes out either way. */
    pub async fn run(mut self) -> Result<()> {
        let result = loop {
            if self.shutdown {
                break Ok(());
            }
            if let Err(e) = self.tick().await {
                break Err(e);
            }
        };
        if let Err(e) = self.base.close().await {
            warn!("Failed to send shutdown frame: {:#}", e);
        }
        result
    }

    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;

        if delta > TICK_OVERRUN {
            warn!("Tick took {} ms!", delta.as_millis());
        }

        while let Ok(command) = self.rx.try_recv() {
            self.apply_command(command).await?;
        }

        if let Some(packet) = self.base.read().await.context("Reading from base")? {
            self.dispatch(packet).await?;
        }

        self.run_deferred(delta.as_millis() as i64).await?;

        self.ping_timer += delta;
        let interval = if self.num_connections > 0 {
            POLL_INTERVAL_ACTIVE
        } else {
            POLL_INTERVAL_IDLE
        };
        if self.ping_timer >= interval {
            self.ping_timer = Duration::ZERO;
            self.base.write(TxPacket::Polling).await?;
        }

        Ok(())
    }

    /* Age the deferred tasks by one tick and fire the due ones. */
    async fn run_deferred(&mut self, delta_ms: i64) -> Result<()> {
        let mut due = Vec::new();
        let mut remaining = Vec::with_capacity(self.deferred.len());
        for mut task in std::mem::take(&mut self.deferred) {
            task.remaining_ms -= delta_ms;
            if task.remaining_ms <= 0 {
                due.push(task.action);
            } else {
                remaining.push(task);
            }
        }
        self.deferred = remaining;

        for action in due {
            match action {
                DeferredAction::ServiceReady { connection_id } => {
                    if let Some(handheld) = slot_ref(&self.connections, connection_id) {
                        self.service.ready(handheld).await;
                    }
                }
                DeferredAction::Command(command) => self.apply_command(command).await?,
            }
        }
        Ok(())
    }

    fn run_later(&mut self, delay_ms: u64, action: DeferredAction) {
        self.deferred.push(DeferredTask {
            remaining_ms: delay_ms as i64,
            action,
        });
    }

    async fn apply_command(&mut self, command: DriverCommand) -> Result<()> {
        match command {
            DriverCommand::SendMessage {
                connection_id,
                window_id,
                text,
                from,
            } => {
                self.base
                    .write(TxPacket::Message {
                        connection_id,
                        window_id,
                        text,
                        from,
                    })
                    .await
            }
            DriverCommand::AddBuddy {
                connection_id,
                screen_name,
                group,
            } => {
                let Some(handheld) = self.slot_mut(connection_id) else {
                    warn!("AddBuddy for idle connection {}", connection_id);
                    return Ok(());
                };
                let buddy = Buddy::new(&screen_name, &group);
                let status = buddy.status_code();
                let group = buddy.group.clone();
                let buddy_id = handheld.add_buddy(buddy);

                self.base
                    .write(TxPacket::BuddyStatus {
                        connection_id,
                        status,
                        buddy_id,
                    })
                    .await?;
                self.base
                    .write(TxPacket::BuddyInfo {
                        connection_id,
                        group,
                        screen_name,
                    })
                    .await
            }
            DriverCommand::SetBuddyStatus {
                connection_id,
                screen_name,
                idle,
                mobile,
                away,
            } => {
                let Some(handheld) = self.slot_mut(connection_id) else {
                    warn!("SetBuddyStatus for idle connection {}", connection_id);
                    return Ok(());
                };
                let Some(buddy) = handheld.buddy_mut(&screen_name) else {
                    warn!("Unknown buddy {:?} on connection {}", screen_name, connection_id);
                    return Ok(());
                };
                buddy.idle = idle;
                buddy.mobile = mobile;
                buddy.away = away;
                let status = buddy.status_code();
                let buddy_id = buddy.buddy_id;

                self.base
                    .write(TxPacket::BuddyStatus {
                        connection_id,
                        status,
                        buddy_id,
                    })
                    .await
            }
            DriverCommand::RunLater { delay_ms, command } => {
                self.run_later(delay_ms, DeferredAction::Command(*command));
                Ok(())
            }
            DriverCommand::Shutdown => {
                info!("Shutdown requested");
                self.shutdown = true;
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, packet: RxPacket) -> Result<()> {
        match packet {
            RxPacket::HandheldRegistration { handheld_id } => {
                self.handle_registration(handheld_id).await
            }
            RxPacket::HandheldConnecting {
                connection_id,
                handheld_id,
            } => self.handle_connecting(connection_id, handheld_id).await,
            RxPacket::HandheldDisconnected { connection_id }
            | RxPacket::HandheldLogoff { connection_id } => {
                self.handle_disconnect(connection_id).await
            }
            RxPacket::HandheldUsername {
                connection_id,
                username,
            } => self.handle_username(connection_id, username).await,
            RxPacket::HandheldPassword {
                connection_id,
                password,
            } => self.handle_password(connection_id, password).await,
            RxPacket::Ack { .. } => {
                self.base.note_ack();
                Ok(())
            }
            RxPacket::MysteryAck { raw } => {
                debug!("Mystery ack: {:02x?}", raw);
                Ok(())
            }
            RxPacket::BaseInitReply => {
                debug!("Spurious init reply");
                Ok(())
            }
            RxPacket::OpenWindow {
                connection_id,
                window_id,
            } => {
                if let Some(handheld) = self.slot_mut(connection_id) {
                    debug!("Handheld {} opened window {}", connection_id, window_id);
                    handheld.set_window(Some(window_id));
                }
                Ok(())
            }
            RxPacket::CloseWindow { connection_id } => {
                if let Some(handheld) = self.slot_mut(connection_id) {
                    debug!("Handheld {} closed its window", connection_id);
                    handheld.set_window(None);
                }
                Ok(())
            }
            RxPacket::HandheldAway {
                connection_id,
                message,
            } => {
                if let Some(handheld) = slot_ref(&self.connections, connection_id) {
                    debug!("Handheld {} away: {:?}", connection_id, message);
                    self.service.away(handheld, &message).await;
                }
                Ok(())
            }
            RxPacket::HandheldWarning { connection_id } => {
                debug!("Handheld {} sent a warning", connection_id);
                Ok(())
            }
            RxPacket::HandheldInvite { connection_id } => {
                debug!("Handheld {} sent an invite", connection_id);
                Ok(())
            }
            RxPacket::HandheldRequestResponse { connection_id } => {
                debug!("Handheld {} request response", connection_id);
                Ok(())
            }
            RxPacket::Message {
                connection_id,
                data,
            } => self.handle_message(connection_id, data).await,
            RxPacket::Unknown { raw } => {
                warn!("Unhandled frame: {:02x?}", raw);
                Ok(())
            }
        }
    }

    async fn handle_registration(&mut self, handheld_id: String) -> Result<()> {
        debug!("Handheld {} attempting to register", handheld_id);
        let accepted = self.manager.register(&handheld_id).await;
        self.base
            .write(TxPacket::RegistrationReply { accepted })
            .await
    }

    async fn handle_connecting(&mut self, connection_id: u8, handheld_id: String) -> Result<()> {
        if !(1..=MAX_CONNECTIONS as u8).contains(&connection_id) {
            warn!("Connect with invalid connection id {}", connection_id);
            return Ok(());
        }
        debug!("Handheld {} connecting, ID: {}", connection_id, handheld_id);

        let Some(connect_data) = self.manager.connect(&handheld_id).await else {
            info!("Connection refused for handheld {}", handheld_id);
            self.base
                .write(TxPacket::Error {
                    connection_id,
                    code: ErrorCode::SessionTerminated,
                })
                .await?;
            return Ok(());
        };

        let slot = &mut self.connections[connection_id as usize];
        if slot.replace(Handheld::new(connection_id, handheld_id)).is_none() {
            self.num_connections += 1;
        }

        self.base
            .write(TxPacket::HandheldInfo {
                connection_id,
                name: connect_data.name.clone(),
            })
            .await?;
        self.base
            .write(TxPacket::ServiceInfo {
                connection_id,
                service_id: self.service.service_id(),
            })
            .await?;

        for event in ToneEvent::ALL {
            let tone = connect_data
                .tones
                .get(&event)
                .cloned()
                .unwrap_or_else(Ringtone::muted);
            trace!("Queued tone {:?} for event {}", tone.name(), event.name());
            self.base
                .write(TxPacket::Ringtone {
                    connection_id,
                    event,
                    tone,
                })
                .await?;
        }

        if let Some(handheld) = self.slot_mut(connection_id) {
            handheld.set_state(ConnectionState::AwaitingUsername);
        }
        Ok(())
    }

    async fn handle_disconnect(&mut self, connection_id: u8) -> Result<()> {
        let Some(handheld) = self.take_slot(connection_id) else {
            debug!("Disconnect for idle connection {}", connection_id);
            return Ok(());
        };
        debug!("Handheld {} disconnected", connection_id);
        self.num_connections -= 1;
        if handheld.state() == ConnectionState::LoggedIn {
            self.service.logout().await;
        }
        Ok(())
    }

    async fn handle_username(&mut self, connection_id: u8, username: String) -> Result<()> {
        let awaiting = self
            .slot(connection_id)
            .is_some_and(|h| h.state() == ConnectionState::AwaitingUsername);
        if !awaiting {
            return self.terminate_session(connection_id).await;
        }
        if let Some(handheld) = self.slot_mut(connection_id) {
            debug!("Handheld {} username: {:?}", connection_id, username);
            handheld.username = Some(username);
            handheld.set_state(ConnectionState::AwaitingPassword);
        }
        Ok(())
    }

    async fn handle_password(&mut self, connection_id: u8, password: String) -> Result<()> {
        let awaiting = self
            .slot(connection_id)
            .is_some_and(|h| h.state() == ConnectionState::AwaitingPassword);
        if !awaiting {
            return self.terminate_session(connection_id).await;
        }
        if let Some(handheld) = self.slot_mut(connection_id) {
            debug!(
                "Handheld {} password received ({} chars)",
                connection_id,
                password.len()
            );
            handheld.password = Some(password);
        }

        let success = match slot_ref(&self.connections, connection_id) {
            Some(handheld) => self.service.login(handheld).await,
            None => false,
        };

        if success {
            if let Some(handheld) = self.slot_mut(connection_id) {
                handheld.set_state(ConnectionState::LoggedIn);
            }
            self.base
                .write(TxPacket::LoginSuccess { connection_id })
                .await?;
            self.run_later(READY_DELAY_MS, DeferredAction::ServiceReady { connection_id });
        } else {
            self.base
                .write(TxPacket::Error {
                    connection_id,
                    code: ErrorCode::ServiceTemporarilyUnavailable,
                })
                .await?;
            if self.take_slot(connection_id).is_some() {
                self.num_connections -= 1;
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, connection_id: u8, data: Vec<u8>) -> Result<()> {
        {
            let Some(handheld) = self.slot_mut(connection_id) else {
                debug!("Message bytes for idle connection {}", connection_id);
                return Ok(());
            };
            handheld.push_message_bytes(&data);
        }

        if data.contains(&FRAME_CONTINUE) {
            /* The handheld holds the rest of the message until it sees an ack. */
            return self.base.write(TxPacket::Ack).await;
        }

        let text = match self.slot_mut(connection_id) {
            Some(handheld) => handheld.take_message(),
            None => return Ok(()),
        };
        if let Some(handheld) = slot_ref(&self.connections, connection_id) {
            debug!("Handheld {} message: {:?}", connection_id, text);
            self.service.message(handheld, &text).await;
        }
        Ok(())
    }

    /* An out-of-state packet ends the session for that connection; the loop
     * keeps servicing everything else. */
    async fn terminate_session(&mut self, connection_id: u8) -> Result<()> {
        warn!(
            "Unexpected packet for connection {}; terminating session",
            connection_id
        );
        if self.take_slot(connection_id).is_some() {
            self.num_connections -= 1;
        }
        if (1..=MAX_CONNECTIONS as u8).contains(&connection_id) {
            self.base
                .write(TxPacket::Error {
                    connection_id,
                    code: ErrorCode::SessionTerminated,
                })
                .await?;
        }
        Ok(())
    }

    fn slot(&self, connection_id: u8) -> Option<&Handheld> {
        slot_ref(&self.connections, connection_id)
    }

    fn slot_mut(&mut self, connection_id: u8) -> Option<&mut Handheld> {
        self.connections
            .get_mut(connection_id as usize)
            .and_then(|slot| slot.as_mut())
    }

    fn take_slot(&mut self, connection_id: u8) -> Option<Handheld> {
        self.connections
            .get_mut(connection_id as usize)
            .and_then(|slot| slot.take())
    }
}

/* Field-level slot lookup, used where a collaborator callback borrows the slot
 * while the service itself is borrowed mutably. */
fn slot_ref(connections: &[Option<Handheld>], connection_id: u8) -> Option<&Handheld> {
    connections
        .get(connection_id as usize)
        .and_then(|slot| slot.as_ref())
}
