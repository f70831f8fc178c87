/* HID transport for the MX240a base station: device open and probe, 8-byte
 * report framing on the write path, and frame reassembly on the read path.
 * All hardware I/O goes through the HidBackend trait so the rest of the
 * driver never touches hidapi directly. */

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::DriverError;
use crate::packets::{FRAME_CONTINUE, FRAME_END};

/* USB identity of the base station. */
pub const VENDOR_ID: u16 = 0x22b8;
pub const PRODUCT_ID: u16 = 0x7f01;
const MANUFACTURER: &str = "Giant Wireless Technology";
const PRODUCT: &str = "MX240a MOTOROLA MESSENGER";

/* Report geometry: 8 data bytes per report, plus the leading 0x00 report-id
 * byte some platforms require on every write. */
pub const REPORT_LEN: usize = 8;

/* The first read of a frame blocks up to a second; top-up reads do not block. */
const READ_TIMEOUT_MS: i32 = 1000;
const READ_BUF_LEN: usize = 255;

pub trait HidBackend: Send + Sync {
    fn write_report(&self, buf: &[u8]) -> Result<usize, DriverError>;
    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, DriverError>;
}

/* hidapi's C library is thread-safe per handle; the Rust binding just does
 * not mark HidDevice as Sync. */
struct HidHandle(hidapi::HidDevice);

unsafe impl Sync for HidHandle {}

impl HidBackend for HidHandle {
    fn write_report(&self, buf: &[u8]) -> Result<usize, DriverError> {
        Ok(self.0.write(buf)?)
    }

    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, DriverError> {
        Ok(self.0.read_timeout(buf, timeout_ms)?)
    }
}

/* The open device plus the per-direction locks. Each lock is held only for
 * the duration of a single report transfer, never nested. */
pub struct HidIo {
    backend: Arc<dyn HidBackend>,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for HidIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidIo").finish_non_exhaustive()
    }
}

impl HidIo {
    /* Open the base station by VID/PID and verify its USB strings. */
    pub fn open() -> Result<Self, DriverError> {
        let api = hidapi::HidApi::new()?;
        let device = api
            .open(VENDOR_ID, PRODUCT_ID)
            .map_err(|_| DriverError::DeviceNotFound)?;

        let manufacturer = device.get_manufacturer_string()?.unwrap_or_default();
        let product = device.get_product_string()?.unwrap_or_default();
        if manufacturer != MANUFACTURER || product != PRODUCT {
            debug!("Rejecting HID device {:?} / {:?}", manufacturer, product);
            return Err(DriverError::DeviceNotFound);
        }
        debug!("mfr: {}", manufacturer);
        debug!("prd: {}", product);

        Ok(Self::with_backend(Arc::new(HidHandle(device))))
    }

    pub fn with_backend(backend: Arc<dyn HidBackend>) -> Self {
        Self {
            backend,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /* Write one frame: split into 8-byte chunks, zero-pad the tail, and prefix
     * every chunk with the 0x00 report id. */
    pub async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let backend = Arc::clone(&self.backend);
        let frame = frame.to_vec();

        tokio::task::spawn_blocking(move || -> Result<(), DriverError> {
            for chunk in frame.chunks(REPORT_LEN) {
                let mut report = [0u8; REPORT_LEN + 1];
                report[1..=chunk.len()].copy_from_slice(chunk);
                trace!("TX {} bytes: {:02x?}", report.len(), report);
                backend.write_report(&report)?;
            }
            Ok(())
        })
        .await
        .context("HID write task failed")??;
        Ok(())
    }

    /* Read one frame: a blocking read, then non-blocking top-ups until a
     * terminator byte appears, then truncate at the first 0xff. The next
     * frame begins in a fresh read. */
    pub async fn read_frame(&self) -> Result<Option<Vec<u8>>> {
        let _guard = self.read_lock.lock().await;
        let backend = Arc::clone(&self.backend);

        let frame = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>, DriverError> {
            let mut buf = [0u8; READ_BUF_LEN];
            let n = backend.read_report(&mut buf, READ_TIMEOUT_MS)?;
            if n == 0 {
                return Ok(None);
            }

            let mut data = buf[..n].to_vec();
            while !data.contains(&FRAME_END) && !data.contains(&FRAME_CONTINUE) {
                let n = backend.read_report(&mut buf, 0)?;
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }

            if let Some(end) = data.iter().position(|&b| b == FRAME_END) {
                data.truncate(end);
            }
            Ok(Some(data))
        })
        .await
        .context("HID read task failed")??;

        if let Some(data) = &frame {
            trace!("RX {} bytes: {:02x?}", data.len(), data);
        }
        Ok(frame.filter(|data| !data.is_empty()))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use super::{HidBackend, REPORT_LEN};
    use crate::error::DriverError;

    /* Scripted backend: queued inbound frames, captured outbound reports. */
    pub(crate) struct MockBackend {
        reads: Mutex<VecDeque<Vec<u8>>>,
        writes: Mutex<Vec<(Instant, Vec<u8>)>>,
    }

    impl MockBackend {
        pub(crate) fn new(frames: Vec<Vec<u8>>) -> Self {
            Self {
                reads: Mutex::new(frames.into()),
                writes: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn written_reports(&self) -> Vec<Vec<u8>> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|(_, report)| report.clone())
                .collect()
        }

        pub(crate) fn timed_reports(&self) -> Vec<(Instant, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl HidBackend for MockBackend {
        fn write_report(&self, buf: &[u8]) -> Result<usize, DriverError> {
            self.writes.lock().unwrap().push((Instant::now(), buf.to_vec()));
            Ok(buf.len())
        }

        fn read_report(&self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize, DriverError> {
            match self.reads.lock().unwrap().pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Ok(0),
            }
        }
    }

    /* The on-wire reports a logical frame becomes: 8-byte chunks, zero
     * padding, leading report id. */
    pub(crate) fn reports_for(frame: &[u8]) -> Vec<Vec<u8>> {
        frame
            .chunks(REPORT_LEN)
            .map(|chunk| {
                let mut report = vec![0u8; REPORT_LEN + 1];
                report[1..=chunk.len()].copy_from_slice(chunk);
                report
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::mock::{MockBackend, reports_for};
    use super::*;

    #[tokio::test]
    async fn write_frame_pads_and_prefixes_reports() {
        let backend = Arc::new(MockBackend::new(Vec::new()));
        let io = HidIo::with_backend(backend.clone());

        io.write_frame(&[0xc3, 0xd9, b'I', b'M', b'F', b'r', b'e', b'e', 0xff])
            .await
            .unwrap();

        let writes = backend.written_reports();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[0],
            vec![0x00, 0xc3, 0xd9, b'I', b'M', b'F', b'r', b'e', b'e']
        );
        assert_eq!(
            writes[1],
            vec![0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        for report in &writes {
            assert_eq!(report.len(), REPORT_LEN + 1);
            assert_eq!(report[0], 0x00);
        }
    }

    #[tokio::test]
    async fn reports_for_matches_write_path() {
        let backend = Arc::new(MockBackend::new(Vec::new()));
        let io = HidIo::with_backend(backend.clone());
        let frame = [0xe4, 0xe5, 0x03, 0xff];

        io.write_frame(&frame).await.unwrap();

        assert_eq!(backend.written_reports(), reports_for(&frame));
    }

    #[tokio::test]
    async fn read_frame_truncates_at_terminator() {
        let backend = Arc::new(MockBackend::new(vec![vec![0xe3, 0xfd, 0xff, 0xaa]]));
        let io = HidIo::with_backend(backend);

        let frame = io.read_frame().await.unwrap();
        assert_eq!(frame, Some(vec![0xe3, 0xfd]));
    }

    #[tokio::test]
    async fn read_frame_joins_reports_until_terminator() {
        let backend = Arc::new(MockBackend::new(vec![
            vec![0xe4, 0x91, b'u', b's'],
            vec![b'e', b'r', 0xff],
        ]));
        let io = HidIo::with_backend(backend);

        let frame = io.read_frame().await.unwrap();
        assert_eq!(frame, Some(vec![0xe4, 0x91, b'u', b's', b'e', b'r']));
    }

    #[tokio::test]
    async fn read_frame_gives_up_without_terminator() {
        let backend = Arc::new(MockBackend::new(vec![vec![0xe4, 0x91, b'u']]));
        let io = HidIo::with_backend(backend);

        /* The device went quiet mid-frame; return what arrived. */
        let frame = io.read_frame().await.unwrap();
        assert_eq!(frame, Some(vec![0xe4, 0x91, b'u']));
    }

    #[tokio::test]
    async fn read_frame_keeps_continuation_marker() {
        let backend = Arc::new(MockBackend::new(vec![vec![0xd4, 0x01, b'H', b'i', 0xfe]]));
        let io = HidIo::with_backend(backend);

        let frame = io.read_frame().await.unwrap();
        assert_eq!(frame, Some(vec![0xd4, 0x01, b'H', b'i', 0xfe]));
    }

    #[tokio::test]
    async fn empty_reads_yield_nothing() {
        let backend = Arc::new(MockBackend::new(Vec::new()));
        let io = HidIo::with_backend(backend);

        assert_eq!(io.read_frame().await.unwrap(), None);

        /* A lone terminator is an empty frame. */
        let backend = Arc::new(MockBackend::new(vec![vec![0xff]]));
        let io = HidIo::with_backend(backend);
        assert_eq!(io.read_frame().await.unwrap(), None);
    }
}
