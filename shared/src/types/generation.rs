//! Hardware generation, engine and collection-mode enums

use serde::{Deserialize, Serialize};
use std::fmt;

/// GPU hardware generation, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Generation {
    Gen9,
    Gen11,
    /// Xe-LP
    Gen12,
    XeHp,
    XeHpg,
    Xe2Hpg,
}

impl Generation {
    pub const ALL: [Generation; 6] = [
        Generation::Gen9,
        Generation::Gen11,
        Generation::Gen12,
        Generation::XeHp,
        Generation::XeHpg,
        Generation::Xe2Hpg,
    ];

    /// Map a PCI device id onto its generation.
    pub fn from_chipset(device_id: u32) -> Option<Self> {
        match device_id & 0xFF00 {
            0x1900 | 0x5900 | 0x3E00 | 0x9B00 => Some(Generation::Gen9),
            0x8A00 | 0x4E00 => Some(Generation::Gen11),
            0x9A00 | 0x4C00 | 0x4600 | 0xA700 => Some(Generation::Gen12),
            0x0200 => Some(Generation::XeHp),
            0x5600 => Some(Generation::XeHpg),
            0xE200 | 0x6400 => Some(Generation::Xe2Hpg),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Generation::Gen9 => "gen9",
            Generation::Gen11 => "gen11",
            Generation::Gen12 => "gen12",
            Generation::XeHp => "xe-hp",
            Generation::XeHpg => "xe-hpg",
            Generation::Xe2Hpg => "xe2-hpg",
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Generation {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "gen9" => Ok(Generation::Gen9),
            "gen11" => Ok(Generation::Gen11),
            "gen12" | "xe-lp" => Ok(Generation::Gen12),
            "xe-hp" => Ok(Generation::XeHp),
            "xe-hpg" => Ok(Generation::XeHpg),
            "xe2-hpg" | "xe2" => Ok(Generation::Xe2Hpg),
            _ => Err(crate::Error::parameter(format!("invalid generation: {}", s))),
        }
    }
}

/// Kernel engine class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineClass {
    Render,
    Copy,
    Video,
    VideoEnhance,
    Compute,
    Other(u16),
}

impl EngineClass {
    /// Engines a hardware counter query can execute on.
    pub fn runs_queries(self) -> bool {
        matches!(self, EngineClass::Render | EngineClass::Compute)
    }
}

/// How a query slot captures hardware counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportCollectingMode {
    /// MI_REPORT_PERF_COUNT writes a whole OA report into slot memory.
    ReportPerformanceCounters,
    /// Each OA counter register is stored to slot memory explicitly.
    StoreRegisterMemoryOar,
    /// A report is triggered into the OA ring buffer and located later.
    TriggerOag,
    /// Ring-buffer trigger tagged with the query report id.
    TriggerOagExtended,
}

impl ReportCollectingMode {
    pub fn uses_ring_buffer(self) -> bool {
        matches!(
            self,
            ReportCollectingMode::TriggerOag | ReportCollectingMode::TriggerOagExtended
        )
    }
}

/// Command streamer a command buffer is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandBufferType {
    #[default]
    Render,
    Compute,
    /// Secondary position-only shading streamer.
    Posh,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_ordering() {
        assert!(Generation::Gen9 < Generation::Gen11);
        assert!(Generation::Gen12 < Generation::XeHp);
    }

    #[test]
    fn test_generation_from_chipset() {
        assert_eq!(Generation::from_chipset(0x1912), Some(Generation::Gen9));
        assert_eq!(Generation::from_chipset(0x8A52), Some(Generation::Gen11));
        assert_eq!(Generation::from_chipset(0x9A49), Some(Generation::Gen12));
        assert_eq!(Generation::from_chipset(0x56A0), Some(Generation::XeHpg));
        assert_eq!(Generation::from_chipset(0xE20B), Some(Generation::Xe2Hpg));
        assert_eq!(Generation::from_chipset(0x1234), None);
    }

    #[test]
    fn test_generation_parse() {
        assert_eq!("xe_hpg".parse::<Generation>().unwrap(), Generation::XeHpg);
        assert_eq!("XE-LP".parse::<Generation>().unwrap(), Generation::Gen12);
        assert!("gen7".parse::<Generation>().is_err());
        for generation in Generation::ALL {
            assert_eq!(generation.name().parse::<Generation>().unwrap(), generation);
        }
    }

    #[test]
    fn test_engine_class() {
        assert!(EngineClass::Render.runs_queries());
        assert!(!EngineClass::Copy.runs_queries());
    }
}
