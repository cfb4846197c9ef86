use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{HeartRateSample, IndoorBikeTelemetry};

/// Heart Rate Measurement flags bit 0: value is a little-endian `u16`
pub const HR_VALUE_FORMAT_UINT16: u8 = 0x01;

bitflags! {
    /// Flags word that prefixes every Indoor Bike Data frame
    ///
    /// Fields follow the flags word in bit order, and only the fields whose
    /// bit is set occupy bytes in the frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IndoorBikeFlags: u16 {
        /// Instantaneous speed, `u16`, 0.01 km/h
        const INSTANTANEOUS_SPEED = 1 << 0;
        /// Average speed, `u16`, 0.01 km/h
        const AVERAGE_SPEED = 1 << 1;
        /// Instantaneous cadence, `u16`, 0.5 rpm
        const INSTANTANEOUS_CADENCE = 1 << 2;
        /// Average cadence, `u16`, 0.5 rpm
        const AVERAGE_CADENCE = 1 << 3;
        /// Total distance, `u24`, metres
        const TOTAL_DISTANCE = 1 << 4;
        /// Resistance level, `i16`
        const RESISTANCE_LEVEL = 1 << 5;
        /// Instantaneous power, `i16`, watts
        const INSTANTANEOUS_POWER = 1 << 6;
        /// Average power, `i16`, watts
        const AVERAGE_POWER = 1 << 7;
        /// Total energy `u16` + energy per hour `u16` + energy per minute `u8`
        const EXPENDED_ENERGY = 1 << 8;
        /// Heart rate, `u8`, bpm
        const HEART_RATE = 1 << 9;
        /// Metabolic equivalent, `u8`, 0.1
        const METABOLIC_EQUIVALENT = 1 << 10;
        /// Elapsed time, `u16`, seconds
        const ELAPSED_TIME = 1 << 11;
        /// Remaining time, `u16`, seconds
        const REMAINING_TIME = 1 << 12;
    }
}

/// Decode a Heart Rate Measurement (0x2A37) notification
///
/// Byte 0 bit 0 selects an 8-bit value at byte 1 or a 16-bit little-endian
/// value at bytes 1-2. Frames too short for the selected format are dropped.
#[must_use]
pub fn decode_heart_rate(payload: &[u8]) -> Option<HeartRateSample> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return None;
    }

    let flags = buf.get_u8();
    let beats_per_minute = if flags & HR_VALUE_FORMAT_UINT16 == 0 {
        u16::from(buf.get_u8())
    } else {
        take_u16(&mut buf)?
    };

    Some(HeartRateSample { beats_per_minute })
}

/// Decode an Indoor Bike Data (0x2AD2) notification
///
/// Returns `None` only when the flags word itself is missing. A frame that
/// runs out of bytes part-way keeps every field decoded up to that point and
/// leaves the flagged field that did not fit, and all later ones, absent.
#[must_use]
pub fn decode_indoor_bike_data(payload: &[u8]) -> Option<IndoorBikeTelemetry> {
    let mut buf = payload;
    if buf.remaining() < 2 {
        return None;
    }

    let flags = IndoorBikeFlags::from_bits_retain(buf.get_u16_le());
    let mut telemetry = IndoorBikeTelemetry::default();

    if read_bike_fields(flags, &mut buf, &mut telemetry).is_none() {
        debug!(
            "Indoor Bike Data truncated: flags={:#06x}, {} bytes",
            flags.bits(),
            payload.len()
        );
    }

    Some(telemetry)
}

fn read_bike_fields(
    flags: IndoorBikeFlags,
    buf: &mut &[u8],
    telemetry: &mut IndoorBikeTelemetry,
) -> Option<()> {
    if flags.contains(IndoorBikeFlags::INSTANTANEOUS_SPEED) {
        telemetry.instantaneous_speed = Some(f64::from(take_u16(buf)?) / 100.0);
    }
    if flags.contains(IndoorBikeFlags::AVERAGE_SPEED) {
        telemetry.average_speed = Some(f64::from(take_u16(buf)?) / 100.0);
    }
    if flags.contains(IndoorBikeFlags::INSTANTANEOUS_CADENCE) {
        telemetry.instantaneous_cadence = Some(f64::from(take_u16(buf)?) / 2.0);
    }
    if flags.contains(IndoorBikeFlags::AVERAGE_CADENCE) {
        telemetry.average_cadence = Some(f64::from(take_u16(buf)?) / 2.0);
    }
    if flags.contains(IndoorBikeFlags::TOTAL_DISTANCE) {
        telemetry.total_distance = Some(take_u24(buf)?);
    }
    if flags.contains(IndoorBikeFlags::RESISTANCE_LEVEL) {
        telemetry.resistance_level = Some(take_i16(buf)?);
    }
    if flags.contains(IndoorBikeFlags::INSTANTANEOUS_POWER) {
        telemetry.instantaneous_power = Some(take_i16(buf)?);
    }
    if flags.contains(IndoorBikeFlags::AVERAGE_POWER) {
        telemetry.average_power = Some(take_i16(buf)?);
    }
    if flags.contains(IndoorBikeFlags::EXPENDED_ENERGY) {
        // all three sub-fields or none
        if buf.remaining() < 5 {
            return None;
        }
        telemetry.total_energy = Some(buf.get_u16_le());
        telemetry.energy_per_hour = Some(buf.get_u16_le());
        telemetry.energy_per_minute = Some(buf.get_u8());
    }
    if flags.contains(IndoorBikeFlags::HEART_RATE) {
        telemetry.heart_rate = Some(take_u8(buf)?);
    }
    if flags.contains(IndoorBikeFlags::METABOLIC_EQUIVALENT) {
        telemetry.metabolic_equivalent = Some(f64::from(take_u8(buf)?) / 10.0);
    }
    if flags.contains(IndoorBikeFlags::ELAPSED_TIME) {
        telemetry.elapsed_time = Some(take_u16(buf)?);
    }
    if flags.contains(IndoorBikeFlags::REMAINING_TIME) {
        telemetry.remaining_time = Some(take_u16(buf)?);
    }
    Some(())
}

fn take_u8(buf: &mut &[u8]) -> Option<u8> {
    (buf.remaining() >= 1).then(|| buf.get_u8())
}

fn take_u16(buf: &mut &[u8]) -> Option<u16> {
    (buf.remaining() >= 2).then(|| buf.get_u16_le())
}

fn take_i16(buf: &mut &[u8]) -> Option<i16> {
    (buf.remaining() >= 2).then(|| buf.get_i16_le())
}

fn take_u24(buf: &mut &[u8]) -> Option<u32> {
    if buf.remaining() < 3 {
        return None;
    }
    u32::try_from(buf.get_uint_le(3)).ok()
}

/// Fitness Machine Control Point op codes used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Ask the trainer for control; required before any other command
    RequestControl = 0x00,
    /// Reset the trainer's training state
    Reset = 0x01,
    /// Set target resistance level, `i16` with 0.1 resolution
    SetTargetResistance = 0x04,
    /// Set target power, `i16` watts
    SetTargetPower = 0x05,
    /// Start or resume
    Start = 0x07,
    /// Stop or pause
    Stop = 0x08,
}

/// A command for the Fitness Machine Control Point (0x2AD9)
///
/// The trainer ignores every command except `RequestControl` until control
/// has been granted. Nothing in this crate checks that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlPointCommand {
    /// Request control of the trainer
    RequestControl,
    /// Reset the trainer
    Reset,
    /// Target resistance level in whole units; sent as `level * 10`
    SetTargetResistance(i32),
    /// Target power in watts
    SetTargetPower(i32),
    /// Start or resume the session
    Start,
    /// Stop or pause the session
    Stop,
}

impl ControlPointCommand {
    /// Op code byte that leads the frame
    #[must_use]
    pub const fn op_code(&self) -> OpCode {
        match self {
            Self::RequestControl => OpCode::RequestControl,
            Self::Reset => OpCode::Reset,
            Self::SetTargetResistance(_) => OpCode::SetTargetResistance,
            Self::SetTargetPower(_) => OpCode::SetTargetPower,
            Self::Start => OpCode::Start,
            Self::Stop => OpCode::Stop,
        }
    }

    /// Encode to the control point frame: op code then little-endian operand
    ///
    /// Operands outside the `i16` range wrap.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);

        buf.put_u8(self.op_code() as u8);

        match *self {
            Self::SetTargetResistance(level) => buf.put_i16_le(wrap_i16(level.wrapping_mul(10))),
            Self::SetTargetPower(watts) => buf.put_i16_le(wrap_i16(watts)),
            Self::RequestControl | Self::Reset | Self::Start | Self::Stop => {}
        }

        buf.freeze()
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn wrap_i16(value: i32) -> i16 {
    value as i16
}
