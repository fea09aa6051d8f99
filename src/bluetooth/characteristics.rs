/// BluVib GATT characteristic map and decoders for read-only readings
use bluer::Uuid;
use time::Time;

use crate::error::RegistryError;

// Configuration parameters
pub const AXES: Uuid = Uuid::from_u128(0x1c93002b_d459_11e7_9296_b8e856369374);
pub const SAMPLE_RATE: Uuid = Uuid::from_u128(0x1c930023_d459_11e7_9296_b8e856369374);
pub const GAIN: Uuid = Uuid::from_u128(0x1c930022_d459_11e7_9296_b8e856369374);
pub const MODE: Uuid = Uuid::from_u128(0x1c930031_d459_11e7_9296_b8e856369374);
pub const HOLDOFF_INTERVAL: Uuid = Uuid::from_u128(0x1c93003a_d459_11e7_9296_b8e856369374);
pub const WAKEUP_INTERVAL: Uuid = Uuid::from_u128(0x1c930036_d459_11e7_9296_b8e856369374);
pub const TRACE_LEN: Uuid = Uuid::from_u128(0x1c930024_d459_11e7_9296_b8e856369374);
pub const TRIGGER_DELAY: Uuid = Uuid::from_u128(0x1c930025_d459_11e7_9296_b8e856369374);

// Measurement and stream characteristics
pub const ACCELERATION_DATA: Uuid = Uuid::from_u128(0x1c930020_d459_11e7_9296_b8e856369374);
pub const CALIBRATION: Uuid = Uuid::from_u128(0x1c930029_d459_11e7_9296_b8e856369374);
pub const TEMPERATURE: Uuid = Uuid::from_u128(0x1c930032_d459_11e7_9296_b8e856369374);
pub const DEVICE_TIME: Uuid = Uuid::from_u128(0x1c930033_d459_11e7_9296_b8e856369374);
pub const BATTERY: Uuid = Uuid::from_u128(0x1c930038_d459_11e7_9296_b8e856369374);

// Write-only triggers, all take the single byte 0x01
pub const COMMIT: Uuid = Uuid::from_u128(0x1c930030_d459_11e7_9296_b8e856369374);
pub const SHUTDOWN: Uuid = Uuid::from_u128(0x1c930040_d459_11e7_9296_b8e856369374);
pub const FACTORY_RESET: Uuid = Uuid::from_u128(0x1c930041_d459_11e7_9296_b8e856369374);
pub const RESTART: Uuid = Uuid::from_u128(0x1c930042_d459_11e7_9296_b8e856369374);

pub const TRIGGER_PAYLOAD: [u8; 1] = [0x01];
pub const CALIBRATION_WIDTH: usize = 2;
pub const ACCELERATION_PACKET_LEN: usize = 16;

/// One-shot device actions exposed next to the commit trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAction {
    Shutdown,
    FactoryReset,
    Restart,
}

impl DeviceAction {
    pub const ALL: [DeviceAction; 3] = [
        DeviceAction::Shutdown,
        DeviceAction::FactoryReset,
        DeviceAction::Restart,
    ];

    pub fn characteristic(self) -> Uuid {
        match self {
            DeviceAction::Shutdown => SHUTDOWN,
            DeviceAction::FactoryReset => FACTORY_RESET,
            DeviceAction::Restart => RESTART,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeviceAction::Shutdown => "Power Off Sensor",
            DeviceAction::FactoryReset => "Factory Reset",
            DeviceAction::Restart => "Restart Sensor",
        }
    }
}

fn signed_le16(data: &[u8]) -> Result<i16, RegistryError> {
    match data {
        [lo, hi] => Ok(i16::from_le_bytes([*lo, *hi])),
        _ => Err(RegistryError::MalformedPayload {
            expected: 2,
            actual: data.len(),
        }),
    }
}

/// Decode the temperature characteristic: signed 16-bit LE in 1/256 °C.
pub fn decode_temperature(data: &[u8]) -> Result<f64, RegistryError> {
    Ok(f64::from(signed_le16(data)?) / 256.0)
}

/// Decode the battery characteristic: signed 16-bit LE in millivolts.
pub fn decode_battery(data: &[u8]) -> Result<f64, RegistryError> {
    Ok(f64::from(signed_le16(data)?) / 1000.0)
}

/// Decode the device clock: three raw bytes {hour, minute, second}.
///
/// Out-of-range components are reported as a malformed payload since the
/// device never produces them on a healthy link.
pub fn decode_device_time(data: &[u8]) -> Result<Time, RegistryError> {
    match data {
        [hour, minute, second] => Time::from_hms(*hour, *minute, *second).map_err(|_| {
            RegistryError::MalformedPayload {
                expected: 3,
                actual: data.len(),
            }
        }),
        _ => Err(RegistryError::MalformedPayload {
            expected: 3,
            actual: data.len(),
        }),
    }
}

/// Decode the unsigned calibration constant read before streaming.
pub fn decode_calibration(data: &[u8]) -> Result<u64, RegistryError> {
    match data {
        [lo, hi] => Ok(u64::from(u16::from_le_bytes([*lo, *hi]))),
        _ => Err(RegistryError::MalformedPayload {
            expected: CALIBRATION_WIDTH,
            actual: data.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_is_scaled_by_256() {
        let celsius = decode_temperature(&[0x64, 0x00]).unwrap();
        assert!((celsius - 0.390625).abs() < 1e-9);
        assert_eq!(format!("{:.2}", celsius), "0.39");

        // 0xF600 = -2560 -> -10 °C
        assert_eq!(decode_temperature(&[0x00, 0xF6]).unwrap(), -10.0);
    }

    #[test]
    fn test_battery_is_scaled_by_1000() {
        // 3300 mV
        assert_eq!(decode_battery(&[0xE4, 0x0C]).unwrap(), 3.3);
    }

    #[test]
    fn test_short_reading_is_malformed() {
        assert_eq!(
            decode_temperature(&[0x64]),
            Err(RegistryError::MalformedPayload {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_device_time_bytes() {
        let t = decode_device_time(&[13, 45, 7]).unwrap();
        assert_eq!((t.hour(), t.minute(), t.second()), (13, 45, 7));
        assert!(decode_device_time(&[25, 0, 0]).is_err());
        assert!(decode_device_time(&[1, 2]).is_err());
    }

    #[test]
    fn test_calibration_is_unsigned() {
        assert_eq!(decode_calibration(&[0xFF, 0xFF]).unwrap(), 65535);
    }

    #[test]
    fn test_action_characteristics_are_distinct() {
        let uuids: Vec<Uuid> = DeviceAction::ALL.iter().map(|a| a.characteristic()).collect();
        assert!(!uuids.contains(&COMMIT));
        assert_eq!(uuids, vec![SHUTDOWN, FACTORY_RESET, RESTART]);
    }
}
