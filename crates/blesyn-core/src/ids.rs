use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;

/// Bluetooth SIG base UUID (`00000000-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Service used when no identifier is configured.
pub const DEFAULT_SERVICE_SHORT: u16 = 0x180D;
/// Characteristic carrying every handshake message.
pub const DEFAULT_CHARACTERISTIC_SHORT: u16 = 0x2A37;

fn expand_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

fn parse_uuid(raw: &str) -> Result<Uuid, CoreError> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if (hex.len() == 4 || hex.len() == 8) && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let short = u32::from_str_radix(hex, 16)
            .map_err(|_| CoreError::InvalidIdentifier(raw.to_string()))?;
        return Ok(expand_short(short));
    }
    Uuid::parse_str(trimmed).map_err(|_| CoreError::InvalidIdentifier(raw.to_string()))
}

fn short_alias(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let alias = (value >> 96) as u32;
    if value & !(0xFFFF_FFFF_u128 << 96) != BLUETOOTH_BASE_UUID {
        return None;
    }
    u16::try_from(alias).ok()
}

macro_rules! gatt_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Builds an identifier from a 16-bit SIG alias.
            pub fn from_short(short: u16) -> Self {
                Self(expand_short(u32::from(short)))
            }

            pub fn uuid(&self) -> Uuid {
                self.0
            }

            /// Returns the 16-bit alias when the UUID sits on the SIG base.
            pub fn short_form(&self) -> Option<u16> {
                short_alias(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_uuid(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.short_form() {
                    Some(short) => write!(f, "{short:04X}"),
                    None => write!(f, "{}", self.0),
                }
            }
        }
    };
}

gatt_identifier!(
    /// GATT service identifier both roles agree on out-of-band.
    ServiceId
);

gatt_identifier!(
    /// GATT characteristic identifier carrying the handshake.
    CharacteristicId
);

impl Default for ServiceId {
    fn default() -> Self {
        Self::from_short(DEFAULT_SERVICE_SHORT)
    }
}

impl Default for CharacteristicId {
    fn default() -> Self {
        Self::from_short(DEFAULT_CHARACTERISTIC_SHORT)
    }
}

/// Opaque platform handle for a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle for one pending ATT read/write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_expand_onto_base_uuid() {
        let id: ServiceId = "180D".parse().expect("short form parses");
        assert_eq!(
            id.uuid().to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(id, ServiceId::default());
        assert_eq!(id.short_form(), Some(0x180D));
        assert_eq!(id.to_string(), "180D");

        let prefixed: CharacteristicId = "0x2a37".parse().expect("hex prefix parses");
        assert_eq!(prefixed, CharacteristicId::default());
    }

    #[test]
    fn full_uuids_round_trip_through_display() {
        let raw = "4b1d0f6c-3a5e-4c5f-8f65-7a7f0dbf2a90";
        let id: ServiceId = raw.parse().expect("full uuid parses");
        assert_eq!(id.short_form(), None);
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = "not-a-uuid".parse::<ServiceId>().expect_err("must fail");
        assert_eq!(err, CoreError::InvalidIdentifier("not-a-uuid".into()));
        assert!("18G0".parse::<CharacteristicId>().is_err());
    }

    #[test]
    fn thirty_two_bit_alias_has_no_short_form() {
        let id: ServiceId = "0001180D".parse().expect("32-bit alias parses");
        assert_eq!(id.short_form(), None);
        assert_ne!(id, ServiceId::default());
    }
}
