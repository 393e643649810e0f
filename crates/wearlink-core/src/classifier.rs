//! Vendor classification from advertised names
//!
//! Total and deterministic: every name maps to exactly one
//! [`VendorProfile`]. A missing name is `Unknown`, not `Generic`, so the
//! channel table has to map unnamed devices on purpose.

use crate::types::{DeviceDescriptor, VendorProfile};

/// Name tokens identifying Samsung devices. Checked before Apple tokens.
const SAMSUNG_TOKENS: [&str; 3] = ["galaxy", "samsung", "gear"];

/// Name tokens identifying Apple devices.
const APPLE_TOKENS: [&str; 2] = ["apple", "watch"];

/// Classify an advertised name.
#[must_use]
pub fn classify_name(name: Option<&str>) -> VendorProfile {
    let Some(name) = name else {
        return VendorProfile::Unknown;
    };

    let name = name.to_lowercase();
    if SAMSUNG_TOKENS.iter().any(|t| name.contains(t)) {
        VendorProfile::Samsung
    } else if APPLE_TOKENS.iter().any(|t| name.contains(t)) {
        VendorProfile::Apple
    } else {
        VendorProfile::Generic
    }
}

/// Classify a discovered device by its advertised name.
#[must_use]
pub fn classify(descriptor: &DeviceDescriptor) -> VendorProfile {
    classify_name(descriptor.advertised_name.as_deref())
}
