//! Characteristic payload decoding
//! Turns raw GATT values into battery and heart-rate readings. Malformed or
//! short payloads decode to `None`; nothing here fails loudly.

/// Flags bit 0: heart-rate value is UINT16 instead of UINT8.
const HR_FLAG_VALUE_U16: u8 = 0x01;
/// Flags bit 1: sensor contact detected.
const HR_FLAG_CONTACT_DETECTED: u8 = 0x02;
/// Flags bit 2: sensor contact feature supported.
const HR_FLAG_CONTACT_SUPPORTED: u8 = 0x04;

/// Decoded Heart Rate Measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub beats_per_minute: u16,
    /// `None` when the sensor does not support contact detection
    pub sensor_contact: Option<bool>,
}

/// Battery Level (0x2A19): the first byte as an unsigned percentage.
/// The value is not clamped here even though the service limits it to 0-100.
pub fn parse_battery_level(data: &[u8]) -> Option<u8> {
    data.first().copied()
}

/// Heart Rate Measurement (0x2A37).
pub fn parse_heart_rate(data: &[u8]) -> Option<HeartRateMeasurement> {
    let (&flags, rest) = data.split_first()?;

    let beats_per_minute = if flags & HR_FLAG_VALUE_U16 == 0 {
        u16::from(*rest.first()?)
    } else {
        match rest {
            [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => return None,
        }
    };

    let sensor_contact = if flags & HR_FLAG_CONTACT_SUPPORTED != 0 {
        Some(flags & HR_FLAG_CONTACT_DETECTED != 0)
    } else {
        None
    };

    Some(HeartRateMeasurement {
        beats_per_minute,
        sensor_contact,
    })
}

/// Lowercase hex rendering used for characteristics without a dedicated decoder.
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_level_first_byte() {
        assert_eq!(parse_battery_level(&[]), None);
        assert_eq!(parse_battery_level(&[55]), Some(55));
        assert_eq!(parse_battery_level(&[200]), Some(200));
        assert_eq!(parse_battery_level(&[90, 1, 2]), Some(90));
    }

    #[test]
    fn heart_rate_uint8() {
        let hr = parse_heart_rate(&[0x00, 0x46]).unwrap();
        assert_eq!(hr.beats_per_minute, 70);
        assert_eq!(hr.sensor_contact, None);
    }

    #[test]
    fn heart_rate_uint16_little_endian() {
        let hr = parse_heart_rate(&[0x01, 0x46, 0x00]).unwrap();
        assert_eq!(hr.beats_per_minute, 70);

        let hr = parse_heart_rate(&[0x01, 0x2C, 0x01]).unwrap();
        assert_eq!(hr.beats_per_minute, 300);
    }

    #[test]
    fn heart_rate_sensor_contact_bits() {
        // supported + detected
        assert_eq!(parse_heart_rate(&[0x06, 60]).unwrap().sensor_contact, Some(true));
        // supported, not detected
        assert_eq!(parse_heart_rate(&[0x04, 60]).unwrap().sensor_contact, Some(false));
        // detected bit without support bit is not a claim
        assert_eq!(parse_heart_rate(&[0x02, 60]).unwrap().sensor_contact, None);
    }

    #[test]
    fn heart_rate_short_payloads() {
        assert_eq!(parse_heart_rate(&[]), None);
        assert_eq!(parse_heart_rate(&[0x00]), None);
        assert_eq!(parse_heart_rate(&[0x01, 0x46]), None);
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(to_hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(to_hex(&[]), "");
    }
}
