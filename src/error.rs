/* Shared driver error definitions: DriverError covers device discovery, the init
 * handshake, HID I/O, and the validation failures raised by the packet and
 * ringtone encoders. */
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    /* VID/PID lookup failed, or the USB strings did not match the base station. */
    #[error("MX240a base station not found (vendor 0x22b8, product 0x7f01)")]
    DeviceNotFound,

    #[error("Base station failed to initialize after {attempts} attempt(s)")]
    InitFailed { attempts: u8 },

    #[error("HID I/O failure: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("Invalid RTTTL data: {0}")]
    InvalidRtttl(String),

    #[error("Invalid service id {0:?}: second character must be one of 'A', 'a', 'M'")]
    InvalidServiceId(String),

    #[error("Invalid connection id {0}: must be in 1..=7")]
    InvalidConnectionId(u8),
}
