//! VESC Motor Controller Driver
//!
//! Talks to one VESC over its USB CDC / UART link using the framed protocol in
//! [`vesc_protocol`](crate::hardware::vesc_protocol).
//!
//! Link Settings:
//! - Baud: 115200, 8N1, no flow control (ignored by USB CDC, required by UART)
//! - Replies are only sent for queries (`FW_VERSION`, `GET_VALUES`)
//! - Set-commands are fire-and-forget
//!
//! The controller drops its commanded current/RPM when it stops hearing from the host, so
//! the driver runs a keep-alive task for as long as the connection is open. The connection
//! and the keep-alive are released when the `VescController` is dropped, whatever path the
//! run takes out of scope.
//!
//! # Usage
//!
//! ```rust,ignore
//! let dut = VescController::open_with("/dev/ttyACM0", 115_200, Duration::from_millis(500)).await?;
//! println!("DUT firmware {}", dut.firmware_version().await?);
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::hardware::capabilities::{CurrentControl, Identified, Measurable, SpeedControl};
use crate::hardware::vesc_protocol::{self, Command};
use crate::measurement::MeasurementSample;

/// Interval between keep-alive frames.
const KEEPALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Serial stream plus the bytes read but not yet framed.
struct Link {
    stream: SerialStream,
    rx: BytesMut,
}

impl Link {
    async fn write_command(&mut self, command: Command) -> Result<()> {
        let frame = vesc_protocol::encode_frame(&command.payload())?;
        self.stream
            .write_all(&frame)
            .await
            .context("VESC write failed")?;
        self.stream.flush().await.context("VESC flush failed")?;
        Ok(())
    }

    /// Read frames until one answers `reply_id`. Unrelated or corrupt frames are skipped.
    async fn read_reply(&mut self, reply_id: u8) -> Result<bytes::Bytes> {
        loop {
            match vesc_protocol::decode_frame(&mut self.rx) {
                Ok(Some(payload)) if payload.first() == Some(&reply_id) => return Ok(payload),
                Ok(Some(payload)) => {
                    tracing::trace!(id = ?payload.first(), "VESC: skipping unrelated frame");
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("VESC: discarding frame: {}", e);
                    continue;
                }
            }

            let n = self
                .stream
                .read_buf(&mut self.rx)
                .await
                .context("VESC read failed")?;
            if n == 0 {
                return Err(anyhow!("VESC port closed"));
            }
        }
    }
}

/// Driver for a single VESC controller.
///
/// Implements all four motor controller capabilities.
pub struct VescController {
    port_name: String,
    link: Arc<Mutex<Link>>,
    timeout: Duration,
    opened_at: Instant,
    keepalive: JoinHandle<()>,
}

impl VescController {
    /// Open the serial port and start the keep-alive.
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened.
    pub async fn open_with(port_path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        let port_path_owned = port_path.to_string();

        // Use spawn_blocking to avoid blocking the async runtime
        let stream = spawn_blocking(move || {
            tokio_serial::new(&port_path_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .context(format!("Failed to open VESC serial port: {}", port_path_owned))
        })
        .await
        .context("spawn_blocking for VESC port opening failed")??;

        let link = Arc::new(Mutex::new(Link {
            stream,
            rx: BytesMut::with_capacity(512),
        }));
        let keepalive = tokio::spawn(keepalive_loop(Arc::clone(&link), port_path.to_string()));

        tracing::info!(port = port_path, baud_rate, "VESC connection opened");

        Ok(Self {
            port_name: port_path.to_string(),
            link,
            timeout,
            opened_at: Instant::now(),
            keepalive,
        })
    }

    /// Serial port this controller is attached to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    async fn send(&self, command: Command) -> Result<()> {
        let mut link = self.link.lock().await;
        tokio::time::timeout(self.timeout, link.write_command(command))
            .await
            .map_err(|_| anyhow!("VESC {}: write timed out", self.port_name))?
    }

    async fn query(&self, command: Command) -> Result<bytes::Bytes> {
        let reply_id = command
            .reply_id()
            .ok_or_else(|| anyhow!("{:?} has no reply", command))?;

        let mut link = self.link.lock().await;
        link.rx.clear();
        let exchange = async {
            link.write_command(command).await?;
            link.read_reply(reply_id).await
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("VESC {}: no reply to {:?}", self.port_name, command))?
    }
}

impl Drop for VescController {
    fn drop(&mut self) {
        self.keepalive.abort();
        tracing::info!(port = %self.port_name, "VESC connection released");
    }
}

async fn keepalive_loop(link: Arc<Mutex<Link>>, port_name: String) {
    let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
    loop {
        ticker.tick().await;
        let result = link.lock().await.write_command(Command::Alive).await;
        if let Err(e) = result {
            tracing::warn!(port = %port_name, "VESC keep-alive failed: {}", e);
        }
    }
}

#[async_trait]
impl SpeedControl for VescController {
    async fn set_rpm(&self, rpm: i32) -> Result<()> {
        tracing::debug!(port = %self.port_name, rpm, "VESC set rpm");
        self.send(Command::SetRpm(rpm)).await
    }
}

#[async_trait]
impl CurrentControl for VescController {
    async fn set_current(&self, milliamps: i32) -> Result<()> {
        tracing::debug!(port = %self.port_name, milliamps, "VESC set current");
        self.send(Command::SetCurrent(milliamps)).await
    }
}

#[async_trait]
impl Measurable for VescController {
    async fn get_measurement(&self) -> Result<MeasurementSample> {
        let payload = self.query(Command::GetValues).await?;
        let time_ms = u64::try_from(self.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(vesc_protocol::parse_values(&payload, time_ms)?)
    }
}

#[async_trait]
impl Identified for VescController {
    async fn firmware_version(&self) -> Result<String> {
        let payload = self.query(Command::FwVersion).await?;
        Ok(vesc_protocol::parse_fw_version(&payload)?)
    }
}
