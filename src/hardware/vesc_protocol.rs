//! VESC Serial Protocol Codec
//!
//! Reference: VESC firmware `comm/packet.c` and `commands.c`
//!
//! Protocol Overview:
//! - Short frame: `0x02, len:u8, payload, crc:u16, 0x03`
//! - Long frame: `0x03, len:u16, payload, crc:u16, 0x03` (payloads of 256 bytes and up)
//! - All multi-byte integers are big-endian
//! - CRC is CRC-16/XMODEM over the payload only
//! - The first payload byte is the command id
//!
//! Only the four commands the dyno needs are encoded here, plus the keep-alive.
//! This module is transport-free so it can be tested without a serial port.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_XMODEM};

use crate::error::{AppResult, DynoError};
use crate::measurement::{FaultCode, MeasurementSample};

/// Firmware version query.
pub const COMM_FW_VERSION: u8 = 0;
/// Telemetry snapshot query.
pub const COMM_GET_VALUES: u8 = 4;
/// Motor current command, i32 milliamps.
pub const COMM_SET_CURRENT: u8 = 6;
/// Speed command, i32 electrical RPM.
pub const COMM_SET_RPM: u8 = 8;
/// Keep-alive; resets the controller's command timeout.
pub const COMM_ALIVE: u8 = 30;

const START_SHORT: u8 = 0x02;
const START_LONG: u8 = 0x03;
const END: u8 = 0x03;

/// Bytes of the `COMM_GET_VALUES` reply this codec reads, after the command id.
const VALUES_LEN: usize = 53;

/// Commands sent from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Ask for the firmware version.
    FwVersion,
    /// Ask for a telemetry snapshot.
    GetValues,
    /// Set motor current in milliamps.
    SetCurrent(i32),
    /// Set electrical RPM.
    SetRpm(i32),
    /// Keep the controller from timing out.
    Alive,
}

impl Command {
    /// Payload bytes, command id first.
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        match *self {
            Command::FwVersion => buf.put_u8(COMM_FW_VERSION),
            Command::GetValues => buf.put_u8(COMM_GET_VALUES),
            Command::SetCurrent(milliamps) => {
                buf.put_u8(COMM_SET_CURRENT);
                buf.put_i32(milliamps);
            }
            Command::SetRpm(rpm) => {
                buf.put_u8(COMM_SET_RPM);
                buf.put_i32(rpm);
            }
            Command::Alive => buf.put_u8(COMM_ALIVE),
        }
        buf.freeze()
    }

    /// Command id the controller answers with, if it answers at all.
    pub fn reply_id(&self) -> Option<u8> {
        match self {
            Command::FwVersion => Some(COMM_FW_VERSION),
            Command::GetValues => Some(COMM_GET_VALUES),
            Command::SetCurrent(_) | Command::SetRpm(_) | Command::Alive => None,
        }
    }
}

/// Frame checksum: CRC-16/XMODEM (poly 0x1021, init 0x0000).
pub const VESC_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Wrap a payload in a frame.
pub fn encode_frame(payload: &[u8]) -> AppResult<Bytes> {
    let len = payload.len();
    let mut frame = BytesMut::with_capacity(len + 6);
    if len < 256 {
        frame.put_u8(START_SHORT);
        frame.put_u8(len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        frame.put_u8(START_LONG);
        frame.put_u16(len);
    } else {
        return Err(DynoError::Protocol(format!(
            "payload of {len} bytes does not fit in a frame"
        )));
    }
    frame.put_slice(payload);
    frame.put_u16(VESC_CRC.checksum(payload));
    frame.put_u8(END);
    Ok(frame.freeze())
}

/// Pull one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Noise ahead of a start byte is discarded.
/// A frame with a bad terminator or CRC is consumed and reported as a protocol error, so the
/// caller can keep reading and resynchronise.
pub fn decode_frame(buf: &mut BytesMut) -> AppResult<Option<Bytes>> {
    let start = buf
        .iter()
        .position(|&b| b == START_SHORT || b == START_LONG);
    match start {
        Some(offset) => buf.advance(offset),
        None => {
            buf.clear();
            return Ok(None);
        }
    }

    let (header, len) = match buf[0] {
        START_SHORT if buf.len() >= 2 => (2, usize::from(buf[1])),
        START_LONG if buf.len() >= 3 => (3, usize::from(u16::from_be_bytes([buf[1], buf[2]]))),
        _ => return Ok(None),
    };

    let total = header + len + 3;
    if buf.len() < total {
        return Ok(None);
    }

    if buf[total - 1] != END {
        buf.advance(1);
        return Err(DynoError::Protocol("frame terminator missing".into()));
    }

    let mut frame = buf.split_to(total);
    frame.advance(header);
    let payload = frame.split_to(len).freeze();
    let crc = frame.get_u16();
    let expected = VESC_CRC.checksum(&payload);
    if crc != expected {
        return Err(DynoError::Protocol(format!(
            "CRC mismatch: got {crc:#06x}, expected {expected:#06x}"
        )));
    }
    Ok(Some(payload))
}

/// Decode a `COMM_GET_VALUES` reply. `time_ms` is supplied by the host.
pub fn parse_values(payload: &[u8], time_ms: u64) -> AppResult<MeasurementSample> {
    let mut buf = expect_reply(payload, COMM_GET_VALUES)?;
    if buf.remaining() < VALUES_LEN {
        return Err(DynoError::Protocol(format!(
            "GET_VALUES reply too short: {} bytes",
            buf.remaining()
        )));
    }

    let temp_fet = f64::from(buf.get_i16()) / 10.0;
    let temp_motor = f64::from(buf.get_i16()) / 10.0;
    let avg_motor_current = f64::from(buf.get_i32()) / 100.0;
    let avg_input_current = f64::from(buf.get_i32()) / 100.0;
    let _avg_id = buf.get_i32();
    let _avg_iq = buf.get_i32();
    let duty_cycle = f64::from(buf.get_i16()) / 1000.0;
    let rpm = f64::from(buf.get_i32());
    let v_in = f64::from(buf.get_i16()) / 10.0;
    // amp hours, amp hours charged, watt hours, watt hours charged, tachometer, tachometer abs
    buf.advance(6 * 4);
    let fault = FaultCode(buf.get_u8());

    Ok(MeasurementSample {
        time_ms,
        rpm,
        duty_cycle,
        v_in,
        avg_motor_current,
        avg_input_current,
        temp_fet,
        temp_motor,
        fault,
    })
}

/// Decode a `COMM_FW_VERSION` reply as `"<major>.<minor>"`, plus the hardware name if sent.
pub fn parse_fw_version(payload: &[u8]) -> AppResult<String> {
    let mut buf = expect_reply(payload, COMM_FW_VERSION)?;
    if buf.remaining() < 2 {
        return Err(DynoError::Protocol("FW_VERSION reply too short".into()));
    }
    let major = buf.get_u8();
    let minor = buf.get_u8();

    let hw_name = buf
        .iter()
        .position(|&b| b == 0)
        .map(|end| String::from_utf8_lossy(&buf[..end]).into_owned())
        .filter(|name| !name.is_empty());

    Ok(match hw_name {
        Some(hw) => format!("{major}.{minor:02} ({hw})"),
        None => format!("{major}.{minor:02}"),
    })
}

fn expect_reply(payload: &[u8], id: u8) -> AppResult<&[u8]> {
    match payload.split_first() {
        Some((&got, rest)) if got == id => Ok(rest),
        Some((&got, _)) => Err(DynoError::Protocol(format!(
            "expected reply to command {id}, got {got}"
        ))),
        None => Err(DynoError::Protocol("empty payload".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values_payload(rpm: i32, fault: u8) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(COMM_GET_VALUES);
        buf.put_i16(315); // temp_fet 31.5
        buf.put_i16(280); // temp_motor 28.0
        buf.put_i32(550); // avg motor current 5.5
        buf.put_i32(120); // avg input current 1.2
        buf.put_i32(0);
        buf.put_i32(0);
        buf.put_i16(250); // duty 0.25
        buf.put_i32(rpm);
        buf.put_i16(481); // v_in 48.1
        for _ in 0..6 {
            buf.put_i32(0);
        }
        buf.put_u8(fault);
        // trailing fields newer firmware appends
        buf.put_i32(0);
        buf.put_u8(0);
        buf.to_vec()
    }

    #[test]
    fn crc_matches_xmodem_check_value() {
        assert_eq!(VESC_CRC.checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn set_current_is_encoded_big_endian() {
        let frame = encode_frame(&Command::SetCurrent(1500).payload()).unwrap();
        assert_eq!(&frame[..7], &[0x02, 0x05, COMM_SET_CURRENT, 0x00, 0x00, 0x05, 0xDC]);
        assert_eq!(frame[frame.len() - 1], END);
    }

    #[test]
    fn long_payloads_use_long_frames() {
        let payload = vec![0xAA; 300];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(&frame[..3], &[START_LONG, 0x01, 0x2C]);

        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().len(), 300);
    }

    #[test]
    fn decode_skips_noise_and_waits_for_more() {
        let frame = encode_frame(&values_payload(3000, 0)).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&[0xFF, 0x00]);
        buf.put_slice(&frame[..10]);

        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.put_slice(&frame[10..]);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(payload[0], COMM_GET_VALUES);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_rejects_corrupted_crc() {
        let frame = encode_frame(&Command::GetValues.payload()).unwrap();
        let mut corrupted = frame.to_vec();
        corrupted[2] ^= 0xFF;
        let mut buf = BytesMut::from(&corrupted[..]);
        assert!(matches!(decode_frame(&mut buf), Err(DynoError::Protocol(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn values_are_scaled() {
        let sample = parse_values(&values_payload(-4200, 6), 77).unwrap();
        assert_eq!(sample.time_ms, 77);
        assert_eq!(sample.rpm, -4200.0);
        assert_eq!(sample.temp_fet, 31.5);
        assert_eq!(sample.avg_motor_current, 5.5);
        assert_eq!(sample.avg_input_current, 1.2);
        assert_eq!(sample.duty_cycle, 0.25);
        assert_eq!(sample.v_in, 48.1);
        assert_eq!(sample.fault, FaultCode(6));
    }

    #[test]
    fn short_values_reply_is_an_error() {
        let payload = values_payload(0, 0);
        assert!(parse_values(&payload[..20], 0).is_err());
        assert!(parse_values(&[COMM_FW_VERSION], 0).is_err());
    }

    #[test]
    fn firmware_version_with_hardware_name() {
        let mut payload = vec![COMM_FW_VERSION, 6, 2];
        payload.extend_from_slice(b"60_MK6\0");
        payload.extend_from_slice(&[0u8; 12]);
        assert_eq!(parse_fw_version(&payload).unwrap(), "6.02 (60_MK6)");
        assert_eq!(parse_fw_version(&[COMM_FW_VERSION, 5, 3]).unwrap(), "5.03");
    }
}
