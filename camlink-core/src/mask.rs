//! Device capability mask.
//!
//! A bitfield of device classes plus one software-only bit. Hardware bits
//! filter by intersection; the software-only bit is never cleared just
//! because a hardware-oriented mask omits it.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Product line / device class flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ProductLine: u32 {
        /// Devices from other vendors exposed through the same backend.
        const THIRD_PARTY = 0x01;
        /// Active stereo depth cameras.
        const STEREO = 0x02;
        /// Coded/structured-light depth cameras.
        const STRUCTURED_LIGHT = 0x04;
        /// Solid-state lidar cameras.
        const LIDAR = 0x08;
        /// Tracking (pose) cameras.
        const TRACKING = 0x10;

        const DEPTH = Self::STEREO.bits() | Self::STRUCTURED_LIGHT.bits() | Self::LIDAR.bits();
        const ANY_NATIVE = 0xfe;
        const ANY = 0xff;

        /// Devices that exist only in software (network, user-injected).
        const SW_ONLY = 0x100;
    }
}

impl Default for ProductLine {
    fn default() -> Self {
        ProductLine::ANY
    }
}

impl ProductLine {
    /// Combine a caller's mask with the mask configured in settings.
    ///
    /// Hardware bits are ANDed; `SW_ONLY` is set when either side sets it.
    pub fn combine(requested: ProductLine, configured: ProductLine) -> ProductLine {
        ProductLine::from_bits_retain(combine_masks(
            requested.bits(),
            configured.bits(),
            ProductLine::SW_ONLY.bits(),
        ))
    }

    /// Whether a device of class `device` passes this mask.
    ///
    /// Software-only devices additionally require `SW_ONLY` in the mask.
    pub fn admits(&self, device: ProductLine, software_only: bool) -> bool {
        if software_only && !self.contains(ProductLine::SW_ONLY) {
            return false;
        }
        let hardware = device & ProductLine::ANY;
        hardware.is_empty() || self.intersects(hardware)
    }
}

/// Raw form of [`ProductLine::combine`] for an arbitrary software-only bit set.
///
/// The software-only bits come from whichever side sets them, so
/// `combine_masks(0b110, 0b011, 0b100)` is `0b110`: the requested side
/// carries `0b100`. Only when neither side sets them is the result a plain AND.
pub fn combine_masks(requested: u32, configured: u32, sw_only: u32) -> u32 {
    let mut mask = requested & configured & !sw_only;
    mask |= (requested | configured) & sw_only;
    mask
}

/// Parse a bit mask given in decimal or `0x`-prefixed hex.
///
/// Shaped for use as a clap `value_parser`.
pub fn parse_mask(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid mask '{s}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_plain_and_without_sw_bit() {
        assert_eq!(combine_masks(0b010, 0b011, 0b100), 0b010);
        assert_eq!(combine_masks(0b011, 0b001, 0b100), 0b001);
        assert_eq!(combine_masks(0b011, 0b010, 0b100), 0b010);
    }

    #[test]
    fn sw_bit_on_requested_side_survives_and() {
        assert_eq!(combine_masks(0b110, 0b011, 0b100), 0b110);
    }

    #[test]
    fn combine_forces_sw_bit_from_either_side() {
        assert_eq!(combine_masks(0b110, 0b100, 0b100) & 0b100, 0b100);
        assert_eq!(combine_masks(0b010, 0b110, 0b100), 0b110);
        assert_eq!(combine_masks(0b000, 0b000, 0b100), 0b000);
    }

    #[test]
    fn combine_product_lines() {
        let requested = ProductLine::STEREO | ProductLine::SW_ONLY;
        let configured = ProductLine::DEPTH;
        let combined = ProductLine::combine(requested, configured);
        assert_eq!(combined, ProductLine::STEREO | ProductLine::SW_ONLY);

        let combined = ProductLine::combine(ProductLine::TRACKING, ProductLine::DEPTH);
        assert!(combined.is_empty());
    }

    #[test]
    fn sw_only_devices_need_sw_bit() {
        assert!(!ProductLine::ANY.admits(ProductLine::STEREO, true));
        assert!((ProductLine::ANY | ProductLine::SW_ONLY).admits(ProductLine::STEREO, true));
        assert!(ProductLine::SW_ONLY.admits(ProductLine::empty(), true));
        assert!(!(ProductLine::TRACKING | ProductLine::SW_ONLY).admits(ProductLine::STEREO, true));
    }

    #[test]
    fn hardware_devices_filter_by_class() {
        assert!(ProductLine::DEPTH.admits(ProductLine::LIDAR, false));
        assert!(!ProductLine::TRACKING.admits(ProductLine::LIDAR, false));
        assert!(!ProductLine::SW_ONLY.admits(ProductLine::LIDAR, false));
    }

    #[test]
    fn masks_parse_as_decimal_or_hex() {
        assert_eq!(parse_mask("0x1fe"), Ok(0x1fe));
        assert_eq!(parse_mask("0X10"), Ok(0x10));
        assert_eq!(parse_mask(" 258 "), Ok(258));
        assert_eq!(parse_mask("0x100"), Ok(ProductLine::SW_ONLY.bits()));
        assert!(parse_mask("0xzz").is_err());
        assert!(parse_mask("-1").is_err());
    }
}
