/* Base-station session: the init handshake, the outbound queue with its
 * immediate/queued split, ack bookkeeping, and the polling-triggered drain. */

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::DriverError;
use crate::packets::{RxPacket, TxPacket};
use crate::transport::HidIo;

/* Handshake budget: attempts, per-attempt reply wait, back-off between
 * attempts. */
const INIT_ATTEMPTS: u8 = 3;
const INIT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/* Queued sends are paced 150 ms apart unless an ack arrived within the last
 * 500 ms, in which case the base is keeping up and the gap is skipped. */
const QUEUE_SEND_GAP: Duration = Duration::from_millis(150);
const ACK_FRESH_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Base {
    io: HidIo,
    write_queue: VecDeque<TxPacket>,
    last_ack: Option<Instant>,
}

impl Base {
    /* Open the real device and run the init handshake. */
    pub async fn open() -> Result<Self> {
        info!("Opening base");
        let io = HidIo::open().context("Opening base station")?;
        Self::init(io, INIT_ATTEMPTS, INIT_REPLY_TIMEOUT, INIT_RETRY_DELAY).await
    }

    #[cfg(test)]
    pub(crate) async fn with_backend(
        backend: std::sync::Arc<dyn crate::transport::HidBackend>,
    ) -> Result<Self> {
        Self::init(
            HidIo::with_backend(backend),
            INIT_ATTEMPTS,
            INIT_REPLY_TIMEOUT,
            INIT_RETRY_DELAY,
        )
        .await
    }

    async fn init(
        io: HidIo,
        attempts: u8,
        reply_timeout: Duration,
        retry_delay: Duration,
    ) -> Result<Self> {
        debug!("Initializing base");
        let mut base = Self {
            io,
            write_queue: VecDeque::new(),
            last_ack: None,
        };

        for attempt in 1..=attempts {
            base.send_now(&TxPacket::BaseInit).await?;
            match tokio::time::timeout(reply_timeout, base.wait_init_reply()).await {
                Ok(Ok(true)) => {
                    debug!("Init success");
                    return Ok(base);
                }
                Ok(Ok(false)) => debug!("Unexpected packet during init (attempt {})", attempt),
                Ok(Err(e)) => return Err(e),
                Err(_) => debug!("No init reply (attempt {})", attempt),
            }
            base.send_now(&TxPacket::BaseShutdown).await?;
            tokio::time::sleep(retry_delay).await;
        }

        Err(DriverError::InitFailed { attempts }.into())
    }

    /* Wait for the EF 01 01 reply; any other decoded frame fails the attempt. */
    async fn wait_init_reply(&mut self) -> Result<bool> {
        loop {
            match self.read().await? {
                Some(RxPacket::BaseInitReply) => return Ok(true),
                Some(packet) => {
                    debug!("Got packet but not init reply: {:?}", packet);
                    return Ok(false);
                }
                None => {}
            }
        }
    }

    pub async fn read(&mut self) -> Result<Option<RxPacket>> {
        let Some(frame) = self.io.read_frame().await? else {
            return Ok(None);
        };
        let packet = RxPacket::decode(&frame);
        trace!("[RECV] {:?}", packet);
        Ok(Some(packet))
    }

    /* Immediate packets hit the wire at once, and polling additionally drains
     * the queue. Everything else waits for the window after the next poll. */
    pub async fn write(&mut self, packet: TxPacket) -> Result<()> {
        if packet.is_immediate() {
            let drain = matches!(packet, TxPacket::Polling);
            self.send_now(&packet).await?;
            if drain {
                self.drain_queue().await?;
            }
        } else {
            self.write_queue.push_back(packet);
        }
        Ok(())
    }

    async fn send_now(&self, packet: &TxPacket) -> Result<()> {
        trace!("[SEND] {:?}", packet);
        for frame in packet.encode()? {
            self.io.write_frame(&frame).await?;
        }
        Ok(())
    }

    async fn drain_queue(&mut self) -> Result<()> {
        while let Some(packet) = self.write_queue.pop_front() {
            let ack_is_fresh = self
                .last_ack
                .is_some_and(|at| at.elapsed() < ACK_FRESH_WINDOW);
            if !ack_is_fresh {
                tokio::time::sleep(QUEUE_SEND_GAP).await;
            }
            self.send_now(&packet).await?;
        }
        Ok(())
    }

    /* Any inbound ack refreshes the pacing window. */
    pub fn note_ack(&mut self) {
        self.last_ack = Some(Instant::now());
    }

    /* Send the shutdown frame; the HID handle closes on drop. */
    pub async fn close(&mut self) -> Result<()> {
        info!("Base shutting down");
        self.send_now(&TxPacket::BaseShutdown).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::transport::mock::{MockBackend, reports_for};

    const INIT_REPLY: &[u8] = &[0xef, 0x01, 0x01, 0xff];

    async fn base_with(frames: Vec<Vec<u8>>) -> (Base, Arc<MockBackend>) {
        let mut all = vec![INIT_REPLY.to_vec()];
        all.extend(frames);
        let backend = Arc::new(MockBackend::new(all));
        let base = Base::with_backend(backend.clone()).await.unwrap();
        (base, backend)
    }

    #[tokio::test]
    async fn init_writes_handshake_and_succeeds() {
        let (_base, backend) = base_with(Vec::new()).await;
        assert_eq!(
            backend.written_reports(),
            reports_for(&[0xad, 0xef, 0x8d, 0xff])
        );
    }

    #[tokio::test]
    async fn init_retries_after_unexpected_packet() {
        let backend = Arc::new(MockBackend::new(vec![
            vec![0xe1, 0xfd, 0xff],
            INIT_REPLY.to_vec(),
        ]));
        let base = Base::init(
            HidIo::with_backend(backend.clone()),
            3,
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
        .await;
        assert!(base.is_ok());

        /* init, shutdown, then the successful retry's init. */
        let mut expected = reports_for(&[0xad, 0xef, 0x8d, 0xff]);
        expected.extend(reports_for(&[0xef, 0x8d, 0xff]));
        expected.extend(reports_for(&[0xad, 0xef, 0x8d, 0xff]));
        assert_eq!(backend.written_reports(), expected);
    }

    #[tokio::test]
    async fn init_fails_after_exhausting_attempts() {
        let backend = Arc::new(MockBackend::new(Vec::new()));
        let err = Base::init(
            HidIo::with_backend(backend.clone()),
            2,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::InitFailed { attempts: 2 })
        ));
        /* Two init attempts, two shutdowns. */
        assert_eq!(backend.written_reports().len(), 4);
    }

    #[tokio::test]
    async fn queued_packets_wait_for_polling() {
        let (mut base, backend) = base_with(Vec::new()).await;
        let init_reports = backend.written_reports().len();

        base.write(TxPacket::LoginSuccess { connection_id: 1 })
            .await
            .unwrap();
        assert_eq!(backend.written_reports().len(), init_reports);

        base.note_ack();
        base.write(TxPacket::Polling).await.unwrap();

        let mut expected = reports_for(&[0xad]);
        expected.extend(reports_for(&[0xe1, 0xd3, 0xff]));
        assert_eq!(backend.written_reports()[init_reports..], expected[..]);
    }

    #[tokio::test]
    async fn immediate_packets_bypass_the_queue() {
        let (mut base, backend) = base_with(Vec::new()).await;
        let init_reports = backend.written_reports().len();

        base.write(TxPacket::RegistrationReply { accepted: true })
            .await
            .unwrap();
        assert_eq!(
            backend.written_reports()[init_reports..],
            reports_for(&[0xee, 0xd3])[..]
        );
    }

    #[tokio::test]
    async fn fresh_ack_skips_the_send_gap() {
        let (mut base, _backend) = base_with(Vec::new()).await;

        for _ in 0..2 {
            base.write(TxPacket::LoginSuccess { connection_id: 1 })
                .await
                .unwrap();
        }
        base.note_ack();

        let started = std::time::Instant::now();
        base.write(TxPacket::Polling).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn stale_ack_paces_queued_sends() {
        let (mut base, _backend) = base_with(Vec::new()).await;

        for _ in 0..2 {
            base.write(TxPacket::LoginSuccess { connection_id: 1 })
                .await
                .unwrap();
        }

        /* No ack observed at all: both sends pay the 150 ms gap. */
        let started = std::time::Instant::now();
        base.write(TxPacket::Polling).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
