/* Packet model for the base-station wire protocol: inbound decode dispatched on
 * the first two frame bytes, byte-exact outbound encoders, and the fixed
 * tone-event and error-code tables the handheld firmware understands. */

use crate::error::DriverError;
use crate::rtttl::Ringtone;

/* Frame terminators. 0xff ends a frame; 0xfe means more data follows in the
 * next read once the handheld sees an ack. */
pub const FRAME_END: u8 = 0xff;
pub const FRAME_CONTINUE: u8 = 0xfe;

/* Ringtone payloads are carried 20 bytes per frame. */
const TONE_CHUNK_LEN: usize = 20;

/* Message payload chunk sizes: group chats carry the sender prefix and get an
 * extra byte per chunk. */
const MESSAGE_CHUNK_DIRECT: usize = 21;
const MESSAGE_CHUNK_GROUP: usize = 22;

/* Printable ASCII retained when assembling text payloads. */
pub fn is_printable(byte: u8) -> bool {
    (0x20..=0x7f).contains(&byte)
}

/* Error numbers the handheld renders on screen (`Ec E5 <errno> FF`). */
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    LoginError = 0x00,
    InvalidNameOrPassword = 0x01,
    ServiceTemporarilyUnavailable = 0x03,
    TooFrequently = 0x04,
    SignedInToAolAlready = 0x05,
    ErrorConnectingToService = 0x07,
    SessionTerminated = 0x08,
    InternetConnectionLost = 0x09,
}

/* Handheld ringtone slots, in the order they are pushed during the connect
 * handshake. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToneEvent {
    NewMessage,
    ContactOnline,
    ContactOffline,
    MessageSent,
    ServiceDisconnected,
    ServiceConnected,
    OutOfRange,
    BackInRange,
    EnterSleepMode,
}

impl ToneEvent {
    pub const ALL: [ToneEvent; 9] = [
        ToneEvent::NewMessage,
        ToneEvent::ContactOnline,
        ToneEvent::ContactOffline,
        ToneEvent::MessageSent,
        ToneEvent::ServiceDisconnected,
        ToneEvent::ServiceConnected,
        ToneEvent::OutOfRange,
        ToneEvent::BackInRange,
        ToneEvent::EnterSleepMode,
    ];

    /* Tone slot byte in the ringtone upload frames. */
    pub fn id(self) -> u8 {
        match self {
            ToneEvent::NewMessage => 0x02,
            ToneEvent::ContactOnline => 0x03,
            ToneEvent::ContactOffline => 0x04,
            ToneEvent::MessageSent => 0x05,
            ToneEvent::ServiceDisconnected => 0x06,
            ToneEvent::ServiceConnected => 0x07,
            ToneEvent::OutOfRange => 0x08,
            ToneEvent::BackInRange => 0x09,
            ToneEvent::EnterSleepMode => 0x0a,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ToneEvent::NewMessage => "new_message",
            ToneEvent::ContactOnline => "contact_online",
            ToneEvent::ContactOffline => "contact_offline",
            ToneEvent::MessageSent => "message_sent",
            ToneEvent::ServiceDisconnected => "service_disconnected",
            ToneEvent::ServiceConnected => "service_connected",
            ToneEvent::OutOfRange => "out_of_range",
            ToneEvent::BackInRange => "back_in_range",
            ToneEvent::EnterSleepMode => "enter_sleep_mode",
        }
    }
}

/* A decoded inbound frame. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxPacket {
    /* A new handheld holding the register button (connection nibble 0 or 0xc). */
    HandheldRegistration { handheld_id: String },
    /* E1/E2-prefixed acks of unknown meaning. */
    MysteryAck { raw: Vec<u8> },
    BaseInitReply,
    Ack { connection_id: u8 },
    HandheldDisconnected { connection_id: u8 },
    HandheldConnecting { connection_id: u8, handheld_id: String },
    HandheldUsername { connection_id: u8, username: String },
    HandheldPassword { connection_id: u8, password: String },
    HandheldLogoff { connection_id: u8 },
    OpenWindow { connection_id: u8, window_id: u8 },
    CloseWindow { connection_id: u8 },
    HandheldAway { connection_id: u8, message: String },
    HandheldWarning { connection_id: u8 },
    HandheldInvite { connection_id: u8 },
    HandheldRequestResponse { connection_id: u8 },
    /* One frame of a (possibly multi-frame) message typed on the handheld. */
    Message { connection_id: u8, data: Vec<u8> },
    Unknown { raw: Vec<u8> },
}

impl RxPacket {
    /* Decoding is a pure function of the first two frame bytes; the third byte
     * onward is variant-specific payload. Frames arrive already truncated at
     * the first 0xff. */
    pub fn decode(raw: &[u8]) -> Self {
        if raw.len() < 2 {
            return Self::Unknown { raw: raw.to_vec() };
        }
        let byte1 = raw[0];
        let byte2 = raw[1];
        let class = byte1 >> 4;
        let connection_id = byte1 & 0x0f;

        /* Connection nibbles 0 and 0xc mark a handheld with no assigned slot. */
        if byte1 == 0xe0 || byte1 == 0xec {
            return Self::HandheldRegistration {
                handheld_id: hex_id(&raw[2..]),
            };
        }
        if (byte1 == 0xe1 || byte1 == 0xe2) && byte2 == 0xfd {
            return Self::MysteryAck { raw: raw.to_vec() };
        }
        if byte1 == 0xef {
            return if raw.len() >= 3 && raw[1] == 0x01 && raw[2] == 0x01 {
                Self::BaseInitReply
            } else {
                Self::Unknown { raw: raw.to_vec() }
            };
        }

        if class == 0xe || class == 0xf {
            return match byte2 {
                0xfd => Self::Ack { connection_id },
                0x8c => Self::HandheldDisconnected { connection_id },
                0x8e => Self::HandheldConnecting {
                    connection_id,
                    handheld_id: hex_id(&raw[2..]),
                },
                _ => match (byte2 >> 4, byte2 & 0x0f) {
                    (0x9..=0xb, 0x1) => Self::HandheldUsername {
                        connection_id,
                        username: read_string(&raw[2..]),
                    },
                    (0x9..=0xb, 0x2) => Self::HandheldPassword {
                        connection_id,
                        password: read_string(&raw[2..]),
                    },
                    (0x9..=0xb, 0x3) => Self::HandheldLogoff { connection_id },
                    (0x9..=0xb, 0x4) => Self::OpenWindow {
                        connection_id,
                        window_id: raw.get(2).copied().unwrap_or(0),
                    },
                    (0x9..=0xb, 0x5) => Self::CloseWindow { connection_id },
                    (0x9..=0xb, 0x6) => Self::HandheldAway {
                        connection_id,
                        message: read_string(&raw[2..]),
                    },
                    (0x9..=0xb, 0xa) => Self::HandheldWarning { connection_id },
                    (0x9..=0xb, 0xb) => Self::HandheldInvite { connection_id },
                    (0x9..=0xb, 0xd) => Self::HandheldRequestResponse { connection_id },
                    (0x9..=0xb, _) => Self::Unknown { raw: raw.to_vec() },
                    _ => Self::Message {
                        connection_id,
                        data: raw.to_vec(),
                    },
                },
            };
        }

        if class == 0x8 || class == 0xa || class == 0xd {
            return Self::Message {
                connection_id,
                data: raw.to_vec(),
            };
        }

        Self::Unknown { raw: raw.to_vec() }
    }
}

/* Handheld ids appear on the wire as four raw bytes and everywhere else as
 * eight hex digits. */
fn hex_id(payload: &[u8]) -> String {
    payload.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

fn read_string(payload: &[u8]) -> String {
    payload
        .iter()
        .copied()
        .filter(|b| is_printable(*b))
        .map(char::from)
        .collect()
}

/* ASCII with '?' standing in for anything the charset cannot carry. */
fn ascii_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

fn valid_connection(connection_id: u8) -> Result<u8, DriverError> {
    if (1..=7).contains(&connection_id) {
        Ok(connection_id)
    } else {
        Err(DriverError::InvalidConnectionId(connection_id))
    }
}

/* An outbound packet. `encode` yields whole frames; the transport splits them
 * into padded 8-byte reports. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPacket {
    /* The cadence packet; sending it opens the queue-drain window. */
    Polling,
    /* Transport-level ack, sent when a message frame ends in 0xfe. */
    Ack,
    BaseInit,
    BaseShutdown,
    RegistrationReply { accepted: bool },
    HandheldInfo { connection_id: u8, name: String },
    ServiceInfo { connection_id: u8, service_id: String },
    Ringtone { connection_id: u8, event: ToneEvent, tone: Ringtone },
    BuddyStatus { connection_id: u8, status: [u8; 3], buddy_id: u8 },
    BuddyInfo { connection_id: u8, group: String, screen_name: String },
    LoginSuccess { connection_id: u8 },
    Error { connection_id: u8, code: ErrorCode },
    /* Driver-to-handheld message. `from` switches to group-chat framing, where
     * the payload leads with "<screen name>:" instead of a 0x00 byte. */
    Message { connection_id: u8, window_id: u8, text: String, from: Option<String> },
}

impl TxPacket {
    /* Immediate packets bypass the outbound queue; everything else waits for
     * the window after the next polling send. */
    pub fn is_immediate(&self) -> bool {
        matches!(
            self,
            Self::Polling
                | Self::Ack
                | Self::BaseInit
                | Self::BaseShutdown
                | Self::RegistrationReply { .. }
        )
    }

    pub fn encode(&self) -> Result<Vec<Vec<u8>>, DriverError> {
        match self {
            Self::Polling => Ok(vec![vec![0xad]]),
            Self::Ack => Ok(vec![vec![0xad, FRAME_END]]),
            Self::BaseInit => Ok(vec![vec![0xad, 0xef, 0x8d, FRAME_END]]),
            Self::BaseShutdown => Ok(vec![vec![0xef, 0x8d, FRAME_END]]),
            Self::RegistrationReply { accepted } => {
                Ok(vec![vec![0xee, if *accepted { 0xd3 } else { 0xc5 }]])
            }
            Self::HandheldInfo { connection_id, name } => {
                let c = valid_connection(*connection_id)?;
                let mut frame = vec![0xc0 | c, 0xd9];
                frame.extend(ascii_bytes(name));
                frame.push(FRAME_END);
                Ok(vec![frame])
            }
            Self::ServiceInfo { connection_id, service_id } => {
                let c = valid_connection(*connection_id)?;
                /* The firmware reads the second character to pick the chat
                 * network (AOL / Yahoo / MSN). */
                if !matches!(service_id.as_bytes().get(1).copied(), Some(b'A' | b'a' | b'M')) {
                    return Err(DriverError::InvalidServiceId(service_id.clone()));
                }
                let mut frame = vec![0xc0 | c, 0xd7];
                frame.extend(ascii_bytes(service_id));
                frame.push(FRAME_END);
                Ok(vec![frame])
            }
            Self::Ringtone { connection_id, event, tone } => {
                let c = valid_connection(*connection_id)?;
                let bytes = tone.tone_bytes();
                let mut frames = Vec::new();

                let mut first = vec![0xc0 | c, 0xcd, event.id()];
                first.extend(bytes.iter().take(TONE_CHUNK_LEN));
                first.push(FRAME_END);
                frames.push(first);

                /* Long tones are re-sent whole as 8c-prefixed continuation
                 * frames, 20 bytes at a time. */
                if bytes.len() > TONE_CHUNK_LEN {
                    for chunk in bytes.chunks(TONE_CHUNK_LEN) {
                        let mut frame = vec![0x80 | c, 0xcd, event.id()];
                        frame.extend_from_slice(chunk);
                        frame.push(FRAME_END);
                        frames.push(frame);
                    }
                }
                Ok(frames)
            }
            Self::BuddyStatus { connection_id, status, buddy_id } => {
                let c = valid_connection(*connection_id)?;
                let mut frame = vec![0xe0 | c, 0xca];
                frame.extend_from_slice(status);
                frame.push(*buddy_id);
                frame.push(FRAME_END);
                Ok(vec![frame])
            }
            Self::BuddyInfo { connection_id, group, screen_name } => {
                let c = valid_connection(*connection_id)?;
                let mut info = vec![0xc0 | c, 0xc9];
                info.extend(ascii_bytes(group));
                info.extend(ascii_bytes(screen_name));
                info.push(FRAME_END);
                info.push(0x00);
                /* Status-modifier trailer the firmware expects right after the
                 * info frame. */
                let trailer = vec![0xa0 | c, 0xc9, 0x01, FRAME_END];
                Ok(vec![info, trailer])
            }
            Self::LoginSuccess { connection_id } => {
                let c = valid_connection(*connection_id)?;
                Ok(vec![vec![0xe0 | c, 0xd3, FRAME_END]])
            }
            Self::Error { connection_id, code } => {
                let c = valid_connection(*connection_id)?;
                Ok(vec![vec![0xe0 | c, 0xe5, *code as u8, FRAME_END]])
            }
            Self::Message { connection_id, window_id, text, from } => {
                let c = valid_connection(*connection_id)?;
                let (payload, chunk_len) = match from {
                    Some(sender) => {
                        let mut payload = ascii_bytes(sender);
                        payload.push(b':');
                        payload.extend(ascii_bytes(text));
                        (payload, MESSAGE_CHUNK_GROUP)
                    }
                    None => {
                        let mut payload = vec![0x00];
                        payload.extend(ascii_bytes(text));
                        (payload, MESSAGE_CHUNK_DIRECT)
                    }
                };

                let chunks: Vec<&[u8]> = payload.chunks(chunk_len).collect();
                let last = chunks.len() - 1;
                let mut frames = Vec::new();
                for (i, chunk) in chunks.iter().enumerate() {
                    let mut frame = vec![0x80 | c, *window_id];
                    frame.extend_from_slice(chunk);
                    if i == last {
                        frame.push(FRAME_END);
                    }
                    frames.push(frame);
                }
                frames.push(vec![0xe0 | c, 0xce, *window_id]);
                Ok(frames)
            }
        }
    }
}
