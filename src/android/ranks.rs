//! Attribute rank table.
//!
//! The platform expects `android:` attributes of an element sorted by their framework resource
//! identifier. The built-in table ships as `assets/attrib.json` (element type -> attribute name
//! -> rank), uses those identifiers as ranks and covers every attribute the patcher writes.
//! A replacement table only has to agree on the order; resource identifiers for new attributes
//! always come from the built-in table.

use crate::error::{PatchError, PatchResult};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const BUILTIN_RANKS: &str = include_str!("../../assets/attrib.json");

static BUILTIN: Lazy<Result<AttributeRanks, String>> =
    Lazy::new(|| AttributeRanks::from_json(BUILTIN_RANKS).map_err(|err| err.to_string()));

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct AttributeRanks {
    elements: BTreeMap<String, BTreeMap<String, u32>>,
}

impl AttributeRanks {
    pub fn builtin() -> PatchResult<&'static AttributeRanks> {
        BUILTIN
            .as_ref()
            .map_err(|msg| PatchError::Config(format!("built-in rank table: {msg}")))
    }

    pub fn from_json(text: &str) -> PatchResult<Self> {
        let ranks: AttributeRanks = serde_json::from_str(text)
            .map_err(|err| PatchError::Config(format!("rank table is not valid JSON: {err}")))?;
        ranks.check_total_order()?;
        Ok(ranks)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PatchResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| PatchError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn rank(&self, element: &str, attribute: &str) -> PatchResult<u32> {
        self.elements
            .get(element)
            .and_then(|attributes| attributes.get(attribute))
            .copied()
            .ok_or_else(|| PatchError::RankLookup {
                element: element.to_string(),
                attribute: attribute.to_string(),
            })
    }

    /// Framework resource identifier of `attribute` on `element`, from the built-in table.
    pub fn resource_id(element: &str, attribute: &str) -> PatchResult<u32> {
        Self::builtin()?.rank(element, attribute)
    }

    // Rank-based insertion is only well defined when no two attributes of an element tie.
    fn check_total_order(&self) -> PatchResult<()> {
        for (element, attributes) in &self.elements {
            let mut seen: BTreeMap<u32, &str> = BTreeMap::new();
            for (name, rank) in attributes {
                if let Some(other) = seen.insert(*rank, name.as_str()) {
                    return Err(PatchError::Config(format!(
                        "<{element}> attributes '{other}' and '{name}' share rank {rank}"
                    )));
                }
            }
        }
        Ok(())
    }
}
