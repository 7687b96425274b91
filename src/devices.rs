//! Registry of supported flash parts.
//!
//! Every part shares the same algorithm; only its descriptor differs.

use std::borrow::Cow;
use crate::device::{DeviceDescriptor, DeviceType, SectorRegion};

/// A descriptor together with the short identifier used to select it.
#[derive(Clone, Debug)]
pub struct DeviceEntry {
    pub id: &'static str,
    pub descriptor: DeviceDescriptor,
}

macro_rules! device {
    ($id:expr, $name:expr, $ty:expr, $start:expr, $size:expr, $page:expr,
     $to_prog:expr, $to_erase:expr, [$(($ssize:expr, $saddr:expr)),+ $(,)?]) => {
        DeviceEntry {
            id: $id,
            descriptor: DeviceDescriptor {
                name: Cow::Borrowed($name),
                device_type: $ty,
                start: $start,
                size: $size,
                page_size: $page,
                erased_value: 0xFF,
                program_timeout_ms: $to_prog,
                erase_timeout_ms: $to_erase,
                sectors: Cow::Borrowed(&[$(SectorRegion::new($ssize, $saddr)),+]),
            },
        }
    };
}

pub const AM29F160DT: DeviceEntry = device!(
    "am29f160dt", "AM29F160DT Flash", DeviceType::Ext16Bit, 0x000000, 0x200000, 1024, 100, 3000,
    [(0x10000, 0x000000),   // 64kB x 31
     (0x08000, 0x1F0000),   // 32kB x 1
     (0x02000, 0x1F8000),   //  8kB x 2
     (0x04000, 0x1FC000)]   // 16kB x 1
);

pub const AM29F320DB: DeviceEntry = device!(
    "am29f320db", "AM29F320DB Flash", DeviceType::Ext16Bit, 0x000000, 0x400000, 1024, 100, 3000,
    [(0x02000, 0x000000),   //  8kB x 8
     (0x10000, 0x010000)]   // 64kB x 63
);

pub const AM29F320DT_X2: DeviceEntry = device!(
    "am29f320dt-x2", "AM29F320DT Dual Flash", DeviceType::Ext32Bit, 0x000000, 0x800000, 1024,
    100, 3000,
    [(0x20000, 0x000000),   // dual 64kB x 63
     (0x04000, 0x7E0000)]   // dual  8kB x 8
);

pub const AM29X033: DeviceEntry = device!(
    "am29x033", "AM29x033 Flash", DeviceType::Ext8Bit, 0x000000, 0x400000, 1024, 300, 3000,
    [(0x10000, 0x000000)]   // 64kB x 64
);

pub const AM29X128: DeviceEntry = device!(
    "am29x128", "AM29x128 Flash", DeviceType::Ext16Bit, 0x000000, 0x1000000, 1024, 100, 3000,
    [(0x10000, 0x000000)]   // 64kB x 256
);

pub const AM29X800BB_X2: DeviceEntry = device!(
    "am29x800bb-x2", "AM29x800BB Dual Flash", DeviceType::Ext32Bit, 0x000000, 0x200000, 1024,
    100, 3000,
    [(0x08000, 0x000000),   // dual 16kB x 1
     (0x10000, 0x008000),   // dual 32kB x 1
     (0x04000, 0x018000),   // dual  8kB x 4
     (0x10000, 0x028000),   // dual 32kB x 1
     (0x08000, 0x038000),   // dual 16kB x 1
     (0x20000, 0x040000)]   // dual 64kB x 14
);

pub const AM29X800BT: DeviceEntry = device!(
    "am29x800bt", "AM29x800BT Flash", DeviceType::Ext16Bit, 0x000000, 0x100000, 1024, 100, 3000,
    [(0x10000, 0x000000),   // 64kB x 14
     (0x04000, 0x0E0000),   // 16kB x 1
     (0x08000, 0x0E4000),   // 32kB x 1
     (0x02000, 0x0EC000),   //  8kB x 4
     (0x08000, 0x0F4000),   // 32kB x 1
     (0x04000, 0x0FC000)]   // 16kB x 1
);

pub const AM29X800BT_X2: DeviceEntry = device!(
    "am29x800bt-x2", "AM29x800BT Dual Flash", DeviceType::Ext32Bit, 0x000000, 0x200000, 1024,
    100, 3000,
    [(0x20000, 0x000000),   // dual 64kB x 14
     (0x08000, 0x1C0000),   // dual 16kB x 1
     (0x10000, 0x1C8000),   // dual 32kB x 1
     (0x04000, 0x1D8000),   // dual  8kB x 4
     (0x10000, 0x1E8000),   // dual 32kB x 1
     (0x08000, 0x1F8000)]   // dual 16kB x 1
);

pub const AM29X800DB: DeviceEntry = device!(
    "am29x800db", "AM29x800DB Flash", DeviceType::Ext16Bit, 0x000000, 0x100000, 1024, 100, 3000,
    [(0x04000, 0x000000),   // 16kB x 1
     (0x02000, 0x004000),   //  8kB x 2
     (0x08000, 0x008000),   // 32kB x 1
     (0x10000, 0x010000)]   // 64kB x 15
);

pub const LPC18XX43XX_S25FL032: DeviceEntry = device!(
    "lpc18xx43xx-s25fl032", "LPC18xx/43xx S25FL032 SPIFI", DeviceType::ExtSpi,
    0x14000000, 0x00400000, 256, 500, 5000,
    [(0x010000, 0)]
);

pub const LPC18XX43XX_S25FL064: DeviceEntry = device!(
    "lpc18xx43xx-s25fl064", "LPC18xx/43xx S25FL064 SPIFI", DeviceType::ExtSpi,
    0x14000000, 0x00800000, 256, 500, 5000,
    [(0x010000, 0)]
);

/// All supported parts.
pub fn all() -> &'static [DeviceEntry] {
    const ALL: &[DeviceEntry] = &[
        AM29F160DT,
        AM29F320DB,
        AM29F320DT_X2,
        AM29X033,
        AM29X128,
        AM29X800BB_X2,
        AM29X800BT,
        AM29X800BT_X2,
        AM29X800DB,
        LPC18XX43XX_S25FL032,
        LPC18XX43XX_S25FL064,
    ];
    ALL
}

/// Look up a part by short id or display name, ignoring case.
pub fn by_name(name: &str) -> Option<&'static DeviceEntry> {
    all().iter().find(|entry| {
        entry.id.eq_ignore_ascii_case(name) || entry.descriptor.name.eq_ignore_ascii_case(name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_descriptors_valid() {
        for entry in all() {
            let d = &entry.descriptor;
            assert_eq!(d.validate(), Ok(()), "{} has an invalid sector map", d.name);
            let total: u64 = (0..d.region_count())
                .map(|i| u64::from(d.sectors[i].size) * u64::from(d.region_sectors(i)))
                .sum();
            assert_eq!(total, u64::from(d.size), "{} sector sizes do not sum", d.name);
        }
    }

    #[test]
    fn test_am29f160dt_map() {
        let d = &AM29F160DT.descriptor;
        let counts: Vec<u32> = (0..d.region_count()).map(|i| d.region_sectors(i)).collect();
        assert_eq!(counts, vec![31, 1, 2, 1]);
        assert_eq!(0x10000 * 31 + 0x8000 + 0x2000 * 2 + 0x4000, 0x200000);
    }

    #[test]
    fn test_sector_counts() {
        assert_eq!(AM29F320DB.descriptor.sector_count(), 8 + 63);
        assert_eq!(AM29F320DT_X2.descriptor.sector_count(), 63 + 8);
        assert_eq!(AM29X033.descriptor.sector_count(), 64);
        assert_eq!(AM29X128.descriptor.sector_count(), 256);
        assert_eq!(AM29X800BB_X2.descriptor.sector_count(), 1 + 1 + 4 + 1 + 1 + 14);
        assert_eq!(AM29X800BT.descriptor.sector_count(), 14 + 1 + 1 + 4 + 1 + 1);
        assert_eq!(AM29X800BT_X2.descriptor.sector_count(), 14 + 1 + 1 + 4 + 1 + 1);
        assert_eq!(AM29X800DB.descriptor.sector_count(), 1 + 2 + 1 + 15);
        assert_eq!(LPC18XX43XX_S25FL032.descriptor.sector_count(), 64);
        assert_eq!(LPC18XX43XX_S25FL064.descriptor.sector_count(), 128);
    }

    #[test]
    fn test_unique_ids() {
        for (i, a) in all().iter().enumerate() {
            for b in &all()[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn test_by_name() {
        assert_eq!(by_name("AM29F320DB").map(|e| e.id), Some("am29f320db"));
        assert_eq!(by_name("am29x800bt dual flash").map(|e| e.id), Some("am29x800bt-x2"));
        assert!(by_name("am29").is_none());
    }

    #[test]
    fn test_bus_types() {
        assert_eq!(AM29X033.descriptor.device_type, DeviceType::Ext8Bit);
        assert!(AM29F320DT_X2.descriptor.bus_width().is_some());
        assert!(LPC18XX43XX_S25FL032.descriptor.bus_width().is_none());
    }
}
