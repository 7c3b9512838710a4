//! Firmware versions and version-gated capabilities
//!
//! The motherboard and every tool board report their own firmware version.
//! Protocol features are gated on those versions; the gating rules live in
//! one table ([`Feature::requirement`]) and are evaluated once when the
//! connection is negotiated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Firmware version as (major, minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version
    pub major: u8,
    /// Minor version, 0..=99
    pub minor: u8,
}

impl Version {
    /// Version from its parts
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Decode the wire representation (`major * 100 + minor`).
    /// Zero means the board did not report a version.
    pub fn from_wire(raw: u16) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(Self::new((raw / 100) as u8, (raw % 100) as u8))
    }

    /// Encode as `major * 100 + minor`
    pub fn to_wire(self) -> u16 {
        self.major as u16 * 100 + self.minor as u16
    }

    /// `self >= other`
    pub fn at_least(self, other: Version) -> bool {
        self >= other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Features whose availability depends on firmware versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Feature {
    /// Motherboard EEPROM parameter access
    OnboardParameters,
    /// SD card capture and playback
    SdCardCapture,
    /// Watchdog reset via the RESET query
    RemoteReset,
    /// Firmware without EEPROM defaults; needs the schema check and wipe
    LegacyEeprom,
    /// Firmware without a bounded response latency; reads never time out
    UnboundedLatency,
    /// Reading tool and platform temperature set points
    SetpointQuery,
    /// WAIT_FOR_PLATFORM command
    WaitForPlatform,
}

/// Version bounds a feature needs. `None` means "no constraint".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    /// Lowest motherboard version that has the feature
    pub motherboard_min: Option<Version>,
    /// First motherboard version that no longer has it
    pub motherboard_below: Option<Version>,
    /// Lowest tool version needed, if the feature lives on the tool
    pub tool_min: Option<Version>,
}

impl Requirement {
    const fn board(min: Version) -> Self {
        Self {
            motherboard_min: Some(min),
            motherboard_below: None,
            tool_min: None,
        }
    }

    fn needs_tool(&self) -> bool {
        self.tool_min.is_some()
    }

    fn satisfied(&self, motherboard: Version, tool: Option<Version>) -> bool {
        if let Some(min) = self.motherboard_min {
            if motherboard < min {
                return false;
            }
        }
        if let Some(below) = self.motherboard_below {
            if motherboard >= below {
                return false;
            }
        }
        match (self.tool_min, tool) {
            (Some(min), Some(tool)) => tool >= min,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl Feature {
    /// Every feature, in declaration order
    pub const ALL: [Feature; 7] = [
        Feature::OnboardParameters,
        Feature::SdCardCapture,
        Feature::RemoteReset,
        Feature::LegacyEeprom,
        Feature::UnboundedLatency,
        Feature::SetpointQuery,
        Feature::WaitForPlatform,
    ];

    /// Version bounds for this feature
    pub fn requirement(self) -> Requirement {
        match self {
            Feature::OnboardParameters => Requirement::board(Version::new(1, 2)),
            Feature::SdCardCapture => Requirement::board(Version::new(1, 3)),
            Feature::RemoteReset => Requirement::board(Version::new(1, 4)),
            Feature::LegacyEeprom | Feature::UnboundedLatency => Requirement {
                motherboard_min: None,
                motherboard_below: Some(Version::new(2, 0)),
                tool_min: None,
            },
            Feature::SetpointQuery => Requirement {
                motherboard_min: None,
                motherboard_below: None,
                tool_min: Some(Version::new(2, 3)),
            },
            Feature::WaitForPlatform => Requirement {
                motherboard_min: Some(Version::new(2, 4)),
                motherboard_below: None,
                tool_min: Some(Version::new(2, 6)),
            },
        }
    }
}

/// Capability table computed once per negotiated connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    board: BTreeSet<Feature>,
    tools: BTreeMap<u8, BTreeSet<Feature>>,
}

impl Capabilities {
    /// Evaluate every feature against the negotiated versions.
    /// `tools` holds the version of each tool board that answered the probe.
    pub fn negotiate(motherboard: Version, tools: &BTreeMap<u8, Version>) -> Self {
        let mut caps = Capabilities::default();
        for feature in Feature::ALL {
            let req = feature.requirement();
            if !req.needs_tool() && req.satisfied(motherboard, None) {
                caps.board.insert(feature);
            }
        }
        for (&index, &version) in tools {
            let set = Feature::ALL
                .into_iter()
                .filter(|f| f.requirement().needs_tool())
                .filter(|f| f.requirement().satisfied(motherboard, Some(version)))
                .collect();
            caps.tools.insert(index, set);
        }
        caps
    }

    /// Motherboard-only feature check
    pub fn supports(&self, feature: Feature) -> bool {
        self.board.contains(&feature)
    }

    /// Feature check for a feature that involves a tool board.
    /// Absent tool boards support nothing.
    pub fn tool_supports(&self, tool: u8, feature: Feature) -> bool {
        self.tools
            .get(&tool)
            .map(|set| set.contains(&feature))
            .unwrap_or(false)
    }
}
