//! GATT identifiers and sample decoding for wearable health devices
//!
//! # Wire layouts
//!
//! | Metric | Layout |
//! |---|---|
//! | Heart rate | byte0 = flags (bit0: 0 = u8 rate, 1 = u16 LE rate); rate at byte1 |
//! | Battery | byte0 = percent (0-100) |
//! | ECG (vendor) | bytes0-1 = i16 LE, µV |
//! | PPG (vendor) | bytes0-3 = f32 LE amplitude; optional byte4 = HR, byte5 = SpO2 |
//!
//! Decoders never panic. Short or impossible payloads yield
//! [`DecodeError::Malformed`] and the caller drops that one sample.

use uuid::Uuid;

use crate::error::DecodeError;
use crate::types::{BatterySample, EcgSample, HeartRateSample, Metric, PpgSample, Sample};

// ============================================================================
// Service / Characteristic UUIDs
// ============================================================================

/// Standard Heart Rate service
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (notify)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Standard Battery service
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (read/notify)
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Samsung health service
pub const SAMSUNG_HEALTH_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000fd00_0000_1000_8000_00805f9b34fb);

/// Samsung ECG characteristic (notify)
pub const SAMSUNG_ECG_UUID: Uuid = Uuid::from_u128(0x0000fd81_0000_1000_8000_00805f9b34fb);

/// Samsung PPG characteristic (notify)
pub const SAMSUNG_PPG_UUID: Uuid = Uuid::from_u128(0x0000fd82_0000_1000_8000_00805f9b34fb);

/// Apple health service
pub const APPLE_HEALTH_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fee0_0000_1000_8000_00805f9b34fb);

/// Apple ECG characteristic (notify)
pub const APPLE_ECG_UUID: Uuid = Uuid::from_u128(0x00006334_0000_1000_8000_00805f9b34fb);

/// Apple PPG characteristic (notify)
pub const APPLE_PPG_UUID: Uuid = Uuid::from_u128(0x00006335_0000_1000_8000_00805f9b34fb);

/// Services whose presence in an advertisement marks a candidate device.
pub const DISCOVERY_SERVICES: [Uuid; 3] = [
    HEART_RATE_SERVICE_UUID,
    SAMSUNG_HEALTH_SERVICE_UUID,
    APPLE_HEALTH_SERVICE_UUID,
];

/// Name prefixes that mark a candidate device.
pub const DISCOVERY_NAME_PREFIXES: [&str; 3] = ["Galaxy", "Apple Watch", "Watch"];

// ============================================================================
// Decoding
// ============================================================================

/// Heart rate flags bit selecting a 16-bit rate.
const HR_FLAG_RATE_U16: u8 = 0x01;

/// PPG amplitudes are folded into `[0, PPG_AMPLITUDE_RANGE)`.
const PPG_AMPLITUDE_RANGE: f32 = 3.0;

/// Payload length at which PPG packets carry derived HR/SpO2.
const PPG_EXTENDED_LEN: usize = 8;

fn malformed(metric: Metric, data: &[u8], reason: &'static str) -> DecodeError {
    DecodeError::Malformed { metric, len: data.len(), reason }
}

/// Decode a Heart Rate Measurement payload.
pub fn decode_heart_rate(data: &[u8], timestamp_us: u64) -> Result<HeartRateSample, DecodeError> {
    let Some(&flags) = data.first() else {
        return Err(malformed(Metric::HeartRate, data, "empty payload"));
    };

    let bpm = if flags & HR_FLAG_RATE_U16 != 0 {
        match data.get(1..3) {
            Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
            _ => return Err(malformed(Metric::HeartRate, data, "missing 16-bit rate")),
        }
    } else {
        match data.get(1) {
            Some(&rate) => u16::from(rate),
            None => return Err(malformed(Metric::HeartRate, data, "missing rate byte")),
        }
    };

    Ok(HeartRateSample { bpm, timestamp_us })
}

/// Decode a Battery Level payload.
pub fn decode_battery(data: &[u8], timestamp_us: u64) -> Result<BatterySample, DecodeError> {
    match data.first() {
        Some(&percent) if percent <= 100 => Ok(BatterySample { percent, timestamp_us }),
        Some(_) => Err(malformed(Metric::Battery, data, "level above 100%")),
        None => Err(malformed(Metric::Battery, data, "empty payload")),
    }
}

/// Decode a vendor ECG payload.
pub fn decode_ecg(data: &[u8], timestamp_us: u64) -> Result<EcgSample, DecodeError> {
    match data.get(0..2) {
        Some(&[lo, hi]) => Ok(EcgSample {
            microvolts: i16::from_le_bytes([lo, hi]),
            timestamp_us,
        }),
        _ => Err(malformed(Metric::Ecg, data, "need 2 bytes")),
    }
}

/// Decode a vendor PPG payload.
///
/// The raw float is folded into `[0, 3)`. Payloads of 8 bytes or more also
/// carry the device's derived heart rate (byte 4) and SpO2 (byte 5).
pub fn decode_ppg(data: &[u8], timestamp_us: u64) -> Result<PpgSample, DecodeError> {
    let raw = match data.get(0..4) {
        Some(&[a, b, c, d]) => f32::from_le_bytes([a, b, c, d]),
        _ => return Err(malformed(Metric::Ppg, data, "need 4 bytes")),
    };

    if !raw.is_finite() {
        return Err(malformed(Metric::Ppg, data, "non-finite amplitude"));
    }

    let amplitude = raw.abs() % PPG_AMPLITUDE_RANGE;

    let (derived_heart_rate, derived_oxygen) = if data.len() >= PPG_EXTENDED_LEN {
        (Some(u16::from(data[4])), Some(data[5]))
    } else {
        (None, None)
    };

    Ok(PpgSample {
        amplitude,
        derived_heart_rate,
        derived_oxygen,
        timestamp_us,
    })
}

/// Decode a payload for the given metric.
pub fn decode(metric: Metric, data: &[u8], timestamp_us: u64) -> Result<Sample, DecodeError> {
    match metric {
        Metric::HeartRate => decode_heart_rate(data, timestamp_us).map(Sample::HeartRate),
        Metric::Ecg => decode_ecg(data, timestamp_us).map(Sample::Ecg),
        Metric::Ppg => decode_ppg(data, timestamp_us).map(Sample::Ppg),
        Metric::Battery => decode_battery(data, timestamp_us).map(Sample::Battery),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: u64 = 1_700_000_000_000_000;

    fn check(metric: Metric, bytes: &[u8], expected: Sample) {
        assert_eq!(decode(metric, bytes, TS), Ok(expected), "{metric} {bytes:?}");
    }

    #[test]
    fn test_decode_table() {
        check(
            Metric::HeartRate,
            &[0x00, 72],
            Sample::HeartRate(HeartRateSample { bpm: 72, timestamp_us: TS }),
        );
        check(
            Metric::HeartRate,
            &[0x01, 72, 0x00],
            Sample::HeartRate(HeartRateSample { bpm: 72, timestamp_us: TS }),
        );
        check(
            Metric::HeartRate,
            &[0x01, 0x2C, 0x01],
            Sample::HeartRate(HeartRateSample { bpm: 300, timestamp_us: TS }),
        );
        // Extra flag bits (contact, RR intervals) do not move the rate
        check(
            Metric::HeartRate,
            &[0x16, 64, 0x10, 0x03],
            Sample::HeartRate(HeartRateSample { bpm: 64, timestamp_us: TS }),
        );
        check(
            Metric::Battery,
            &[85],
            Sample::Battery(BatterySample { percent: 85, timestamp_us: TS }),
        );
        check(
            Metric::Ecg,
            &[0xF4, 0x01],
            Sample::Ecg(EcgSample { microvolts: 500, timestamp_us: TS }),
        );
        check(
            Metric::Ecg,
            &[0x38, 0xFF, 0xAA],
            Sample::Ecg(EcgSample { microvolts: -200, timestamp_us: TS }),
        );
    }

    #[test]
    fn test_heart_rate_is_not_clamped() {
        let s = decode_heart_rate(&[0x00, 0xFF], TS).unwrap();
        assert_eq!(s.bpm, 255);
        let s = decode_heart_rate(&[0x00, 0x00], TS).unwrap();
        assert_eq!(s.bpm, 0);
    }

    #[test]
    fn test_heart_rate_truncated() {
        assert!(decode_heart_rate(&[], TS).is_err());
        assert!(decode_heart_rate(&[0x00], TS).is_err());
        assert!(decode_heart_rate(&[0x01, 72], TS).is_err());
    }

    #[test]
    fn test_battery_out_of_range() {
        assert!(matches!(
            decode_battery(&[101], TS),
            Err(DecodeError::Malformed { metric: Metric::Battery, .. })
        ));
        assert!(decode_battery(&[], TS).is_err());
        assert_eq!(decode_battery(&[0], TS).unwrap().percent, 0);
        assert_eq!(decode_battery(&[100], TS).unwrap().percent, 100);
    }

    #[test]
    fn test_ecg_truncated() {
        assert!(decode_ecg(&[0x01], TS).is_err());
    }

    #[test]
    fn test_ppg_short_payload() {
        let mut data = 1.5f32.to_le_bytes().to_vec();
        let s = decode_ppg(&data, TS).unwrap();
        assert!((s.amplitude - 1.5).abs() < f32::EPSILON);
        assert_eq!(s.derived_heart_rate, None);
        assert_eq!(s.derived_oxygen, None);

        // 4..8 bytes still has no derived vitals
        data.extend_from_slice(&[80, 97]);
        let s = decode_ppg(&data, TS).unwrap();
        assert_eq!(s.derived_heart_rate, None);
    }

    #[test]
    fn test_ppg_extended_payload() {
        let mut data = 1.25f32.to_le_bytes().to_vec();
        data.extend_from_slice(&[76, 97, 0, 0]);

        let s = decode_ppg(&data, TS).unwrap();
        assert!((s.amplitude - 1.25).abs() < f32::EPSILON);
        assert_eq!(s.derived_heart_rate, Some(76));
        assert_eq!(s.derived_oxygen, Some(97));
    }

    #[test]
    fn test_ppg_amplitude_folded() {
        let s = decode_ppg(&(-4.5f32).to_le_bytes(), TS).unwrap();
        assert!((s.amplitude - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_ppg_malformed() {
        assert!(decode_ppg(&[0x00, 0x00, 0x80], TS).is_err());
        assert!(decode_ppg(&f32::NAN.to_le_bytes(), TS).is_err());
        assert!(decode_ppg(&f32::INFINITY.to_le_bytes(), TS).is_err());
    }

    #[test]
    fn test_uuids_use_bluetooth_base() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(APPLE_PPG_UUID.to_string(), "00006335-0000-1000-8000-00805f9b34fb");
    }
}
