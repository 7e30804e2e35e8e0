//! Riot account identifiers and platform routing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// A `gameName#tagLine` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiotId {
    pub game_name: String,
    pub tag_line: String,
}

pub fn parse_riot_id(riot_id: &str) -> Option<RiotId> {
    let idx = riot_id.find('#')?;
    if idx == 0 || idx == riot_id.len() - 1 {
        return None;
    }
    let game_name = riot_id[..idx].trim();
    let tag_line = riot_id[idx + 1..].trim();
    if game_name.is_empty() || tag_line.is_empty() {
        return None;
    }
    Some(RiotId {
        game_name: game_name.to_string(),
        tag_line: tag_line.to_string(),
    })
}

/// Platform routing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Br1,
    Eun1,
    Euw1,
    Jp1,
    Kr,
    La1,
    La2,
    Na1,
    Oc1,
    Tr1,
    Ru,
    Ph2,
    Sg2,
    Th2,
    Tw2,
    Vn2,
}

/// Regional routing values used by account lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuperRegion {
    Americas,
    Europe,
    Asia,
    Sea,
}

impl Region {
    pub const ALL: [Region; 16] = [
        Self::Br1,
        Self::Eun1,
        Self::Euw1,
        Self::Jp1,
        Self::Kr,
        Self::La1,
        Self::La2,
        Self::Na1,
        Self::Oc1,
        Self::Tr1,
        Self::Ru,
        Self::Ph2,
        Self::Sg2,
        Self::Th2,
        Self::Tw2,
        Self::Vn2,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Br1 => "BR1",
            Self::Eun1 => "EUN1",
            Self::Euw1 => "EUW1",
            Self::Jp1 => "JP1",
            Self::Kr => "KR",
            Self::La1 => "LA1",
            Self::La2 => "LA2",
            Self::Na1 => "NA1",
            Self::Oc1 => "OC1",
            Self::Tr1 => "TR1",
            Self::Ru => "RU",
            Self::Ph2 => "PH2",
            Self::Sg2 => "SG2",
            Self::Th2 => "TH2",
            Self::Tw2 => "TW2",
            Self::Vn2 => "VN2",
        }
    }

    pub fn super_region(self) -> SuperRegion {
        match self {
            Self::Br1 | Self::La1 | Self::La2 | Self::Na1 => SuperRegion::Americas,
            Self::Eun1 | Self::Euw1 | Self::Tr1 | Self::Ru => SuperRegion::Europe,
            Self::Jp1 | Self::Kr => SuperRegion::Asia,
            Self::Oc1 | Self::Ph2 | Self::Sg2 | Self::Th2 | Self::Tw2 | Self::Vn2 => SuperRegion::Sea,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|r| r.code() == wanted)
            .ok_or_else(|| AppError::invalid(format!("Unknown region: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_riot_ids() {
        let id = parse_riot_id("Faker#KR1").unwrap();
        assert_eq!(id.game_name, "Faker");
        assert_eq!(id.tag_line, "KR1");

        let id = parse_riot_id(" Hide on bush # KR1 ").unwrap();
        assert_eq!(id.game_name, "Hide on bush");
        assert_eq!(id.tag_line, "KR1");
    }

    #[test]
    fn rejects_malformed_riot_ids() {
        for bad in ["", "NoTag", "#KR1", "Faker#", "   #  ", "Faker# "] {
            assert!(parse_riot_id(bad).is_none(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn routes_regions() {
        assert_eq!(Region::Euw1.super_region(), SuperRegion::Europe);
        assert_eq!(Region::Na1.super_region(), SuperRegion::Americas);
        assert_eq!(Region::Kr.super_region(), SuperRegion::Asia);
        assert_eq!(Region::Oc1.super_region(), SuperRegion::Sea);
    }

    #[test]
    fn region_codes_round_trip_through_serde() {
        for region in Region::ALL {
            let json = serde_json::to_string(&region).unwrap();
            assert_eq!(json, format!("\"{}\"", region.code()));
            assert_eq!(region.code().parse::<Region>().unwrap(), region);
        }
        assert_eq!("euw1".parse::<Region>().unwrap(), Region::Euw1);
        assert!("EU".parse::<Region>().is_err());
    }
}
