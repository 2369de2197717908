//! Catalog of Particle device platforms.
//!
//! Application firmware enumerates with the shared vendor id and a product
//! id encoding the platform id; DFU mode uses a parallel product-id range.
//! Each platform carries the set of connectivity capabilities its hardware
//! supports, which gates the capability-specific session helpers.

/// USB vendor id shared by all Particle platforms.
pub const VENDOR_ID: u16 = 0x2b04;

const PRODUCT_ID_BASE: u16 = 0xc000;
const DFU_PRODUCT_ID_BASE: u16 = 0xd000;
const PLATFORM_ID_MASK: u16 = 0x0fff;

/// A connectivity capability of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Capability {
    /// Wi-Fi network interface.
    Wifi = 0,

    /// Cellular modem.
    Cellular = 1,

    /// Mesh networking (gen 3 devices).
    Mesh = 2,
}

/// Set of [`Capability`] values, stored as a small bitset.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// The empty set.
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    fn mask(capability: Capability) -> u32 {
        1 << capability as u8
    }

    /// This set plus `capability`.
    pub const fn with(self, capability: Capability) -> CapabilitySet {
        CapabilitySet(self.0 | 1 << capability as u8)
    }

    /// Whether `capability` is in the set.
    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & Self::mask(capability) != 0
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        for capability in [Capability::Wifi, Capability::Cellular, Capability::Mesh] {
            if self.contains(capability) {
                set.entry(&capability);
            }
        }
        set.finish()
    }
}

/// A Particle device platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    id: u16,
    name: &'static str,
    capabilities: CapabilitySet,
}

impl Platform {
    /// Numeric platform id, as reported by Device OS.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Display name of the platform.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Connectivity capabilities of the platform's hardware.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Whether the platform's hardware has `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Product id used when running application firmware.
    pub fn product_id(&self) -> u16 {
        PRODUCT_ID_BASE | self.id
    }

    /// Product id used in DFU mode.
    pub fn dfu_product_id(&self) -> u16 {
        DFU_PRODUCT_ID_BASE | self.id
    }
}

const fn platform(id: u16, name: &'static str, capabilities: CapabilitySet) -> Platform {
    Platform {
        id,
        name,
        capabilities,
    }
}

const WIFI: CapabilitySet = CapabilitySet::EMPTY.with(Capability::Wifi);
const CELLULAR: CapabilitySet = CapabilitySet::EMPTY.with(Capability::Cellular);
const WIFI_MESH: CapabilitySet = WIFI.with(Capability::Mesh);
const CELLULAR_MESH: CapabilitySet = CELLULAR.with(Capability::Mesh);

/// All platforms known to this library.
pub static PLATFORMS: &[Platform] = &[
    platform(6, "Photon", WIFI),
    platform(8, "P1", WIFI),
    platform(10, "Electron", CELLULAR),
    platform(12, "Argon", WIFI_MESH),
    platform(13, "Boron", CELLULAR_MESH),
    platform(14, "Xenon", CapabilitySet::EMPTY.with(Capability::Mesh)),
    platform(22, "A SoM", WIFI_MESH),
    platform(23, "B SoM", CELLULAR_MESH),
    platform(25, "B5 SoM", CELLULAR_MESH),
    platform(26, "Tracker", CELLULAR),
    platform(32, "P2", WIFI),
];

/// Look up a platform by its numeric id.
pub fn platform_for_id(id: u16) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|p| p.id == id)
}

/// Map a (vendor id, product id) pair to a platform.
///
/// Returns the platform and whether the product id is the DFU-mode one.
pub fn platform_for_usb_ids(vendor_id: u16, product_id: u16) -> Option<(&'static Platform, bool)> {
    if vendor_id != VENDOR_ID {
        return None;
    }
    let dfu = match product_id & !PLATFORM_ID_MASK {
        PRODUCT_ID_BASE => false,
        DFU_PRODUCT_ID_BASE => true,
        _ => return None,
    };
    platform_for_id(product_id & PLATFORM_ID_MASK).map(|p| (p, dfu))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_id_encodes_platform_id() {
        let boron = platform_for_id(13).unwrap();
        assert_eq!(boron.name(), "Boron");
        assert_eq!(boron.product_id(), 0xc00d);
        assert_eq!(boron.dfu_product_id(), 0xd00d);
    }

    #[test]
    fn usb_id_lookup() {
        let (photon, dfu) = platform_for_usb_ids(VENDOR_ID, 0xc006).unwrap();
        assert_eq!(photon.id(), 6);
        assert!(!dfu);

        let (argon, dfu) = platform_for_usb_ids(VENDOR_ID, 0xd00c).unwrap();
        assert_eq!(argon.name(), "Argon");
        assert!(dfu);

        assert!(platform_for_usb_ids(0x1d50, 0xc006).is_none());
        assert!(platform_for_usb_ids(VENDOR_ID, 0xe006).is_none());
        assert!(platform_for_usb_ids(VENDOR_ID, 0xc0ff).is_none());
    }

    #[test]
    fn capability_sets() {
        let boron = platform_for_id(13).unwrap();
        assert!(boron.has_capability(Capability::Cellular));
        assert!(boron.has_capability(Capability::Mesh));
        assert!(!boron.has_capability(Capability::Wifi));

        let p2 = platform_for_id(32).unwrap();
        assert!(p2.has_capability(Capability::Wifi));
        assert!(!p2.has_capability(Capability::Mesh));

        assert!(CapabilitySet::EMPTY.is_empty());
        assert!(!p2.capabilities().is_empty());
        assert_eq!(format!("{:?}", WIFI_MESH), "{Wifi, Mesh}");
    }
}
