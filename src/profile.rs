use std::fmt;
use uuid::Uuid;

use crate::{
    protocol::{decode_heart_rate, decode_indoor_bike_data},
    types::{HeartRateSample, IndoorBikeTelemetry, PeripheralRole},
    FITNESS_MACHINE_CONTROL_POINT_UUID, FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
};

/// GATT layout and decoder for one peripheral role
pub trait Profile: Send + Sync + 'static {
    /// Telemetry value published for each measurement notification
    type Sample: Clone + fmt::Debug + PartialEq + Send + Sync + 'static;

    /// Role served by this profile
    const ROLE: PeripheralRole;
    /// Primary service holding the measurement characteristic
    const SERVICE: Uuid;
    /// Characteristic whose notifications carry telemetry
    const MEASUREMENT: Uuid;
    /// Writable control characteristic in the same service, if the role has one
    const CONTROL_POINT: Option<Uuid>;

    /// Decode one notification; `None` drops the frame
    fn decode(payload: &[u8]) -> Option<Self::Sample>;
}

/// Heart-rate strap: Heart Rate service, Heart Rate Measurement notifications
#[derive(Debug, Clone, Copy)]
pub struct HeartRateProfile;

impl Profile for HeartRateProfile {
    type Sample = HeartRateSample;

    const ROLE: PeripheralRole = PeripheralRole::HeartRate;
    const SERVICE: Uuid = HEART_RATE_SERVICE_UUID;
    const MEASUREMENT: Uuid = HEART_RATE_MEASUREMENT_UUID;
    const CONTROL_POINT: Option<Uuid> = None;

    fn decode(payload: &[u8]) -> Option<Self::Sample> {
        decode_heart_rate(payload)
    }
}

/// Smart trainer: Fitness Machine service, Indoor Bike Data notifications
#[derive(Debug, Clone, Copy)]
pub struct IndoorBikeProfile;

impl Profile for IndoorBikeProfile {
    type Sample = IndoorBikeTelemetry;

    const ROLE: PeripheralRole = PeripheralRole::Trainer;
    const SERVICE: Uuid = FITNESS_MACHINE_SERVICE_UUID;
    const MEASUREMENT: Uuid = INDOOR_BIKE_DATA_UUID;
    const CONTROL_POINT: Option<Uuid> = Some(FITNESS_MACHINE_CONTROL_POINT_UUID);

    fn decode(payload: &[u8]) -> Option<Self::Sample> {
        decode_indoor_bike_data(payload)
    }
}
