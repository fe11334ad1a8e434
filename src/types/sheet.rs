//! Parsed sheet facts and draft entities

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How a building block of the ledger is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutPolicy {
    /// Block is ignored entirely
    Excluded,
    /// Rows carry no apartment code; the whole label names the owner
    Miscellaneous,
    /// Rows read as "<code> - <owner>"
    Standard,
}

/// Building-name labels that select a non-standard layout policy.
///
/// Matching is a case-insensitive substring test against the building name.
#[derive(Debug, Clone)]
pub struct LayoutRules {
    pub excluded: Vec<String>,
    pub miscellaneous: Vec<String>,
}

impl Default for LayoutRules {
    fn default() -> Self {
        Self {
            excluded: vec!["LIMPIEZAS EXTERNAS".to_string()],
            miscellaneous: vec!["OTROS APARTAMENTOS".to_string()],
        }
    }
}

impl LayoutRules {
    pub fn classify(&self, building_name: &str) -> LayoutPolicy {
        let upper = building_name.to_uppercase();
        let hit = |labels: &[String]| {
            labels
                .iter()
                .any(|l| !l.trim().is_empty() && upper.contains(&l.trim().to_uppercase()))
        };
        if hit(&self.excluded) {
            LayoutPolicy::Excluded
        } else if hit(&self.miscellaneous) {
            LayoutPolicy::Miscellaneous
        } else {
            LayoutPolicy::Standard
        }
    }
}

/// One occupied (apartment row, date column) cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawCellFact {
    pub building: String,
    pub policy: LayoutPolicy,
    pub row_label: String,
    pub apartment_code: Option<String>,
    pub owner_label: String,
    pub date: NaiveDate,
    pub rate: f64,
    pub comment: Option<String>,
    pub color_hex: Option<String>,
    pub row: u32,
    pub col: u32,
}

/// A cell that was skipped while parsing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellWarning {
    pub cell: String,
    pub message: String,
}

/// Everything the layout parser extracted from one sheet
#[derive(Debug, Clone, Serialize)]
pub struct SheetReport {
    pub sheet_name: String,
    pub month: u32,
    pub year: i32,
    pub facts: Vec<RawCellFact>,
    pub warnings: Vec<CellWarning>,
    pub buildings_seen: usize,
    pub buildings_skipped: usize,
}

// =============================================================================
// Draft entities (also the bulk JSON import format)
// =============================================================================

/// One apartment-day ready for reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationDraft {
    pub date: NaiveDate,
    pub rate: f64,
    #[serde(default)]
    pub color_hex: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub reference_code: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApartmentDraft {
    pub code: Option<String>,
    /// Empty when the row carries no owner
    #[serde(default)]
    pub owner: String,
    pub raw_text: String,
    #[serde(default)]
    pub reservations: Vec<ReservationDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingDraft {
    pub name: String,
    #[serde(default)]
    pub apartments: Vec<ApartmentDraft>,
}

/// Drafts of one month sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetPayload {
    pub month: u32,
    pub year: i32,
    #[serde(default)]
    pub buildings: Vec<BuildingDraft>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedSheetPayload {
    pub name: String,
    pub data: SheetPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSheetPayload {
    pub sheets: Vec<NamedSheetPayload>,
}

/// Bulk import input: one sheet or several
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImportPayload {
    Multi(MultiSheetPayload),
    Single(SheetPayload),
}

impl SheetPayload {
    pub fn reservation_count(&self) -> usize {
        self.buildings
            .iter()
            .flat_map(|b| b.apartments.iter())
            .map(|a| a.reservations.len())
            .sum()
    }

    pub fn apartment_count(&self) -> usize {
        self.buildings.iter().map(|b| b.apartments.len()).sum()
    }
}

impl ImportPayload {
    pub fn sheets(&self) -> Vec<&SheetPayload> {
        match self {
            ImportPayload::Multi(m) => m.sheets.iter().map(|s| &s.data).collect(),
            ImportPayload::Single(s) => vec![s],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_excluded_building() {
        let rules = LayoutRules::default();
        assert_eq!(rules.classify("LIMPIEZAS EXTERNAS"), LayoutPolicy::Excluded);
        assert_eq!(rules.classify("  limpiezas externas 2 "), LayoutPolicy::Excluded);
    }

    #[test]
    fn test_classify_miscellaneous_building() {
        let rules = LayoutRules::default();
        assert_eq!(rules.classify("OTROS APARTAMENTOS"), LayoutPolicy::Miscellaneous);
    }

    #[test]
    fn test_classify_standard_building() {
        let rules = LayoutRules::default();
        assert_eq!(rules.classify("TORRE MARINA"), LayoutPolicy::Standard);
    }

    #[test]
    fn test_classify_ignores_blank_labels() {
        let rules = LayoutRules {
            excluded: vec!["".to_string()],
            miscellaneous: vec![],
        };
        assert_eq!(rules.classify("ANYTHING"), LayoutPolicy::Standard);
    }

    #[test]
    fn test_import_payload_single_sheet_deserializes() {
        let json = r#"{"month": 3, "year": 2025, "buildings": []}"#;
        let payload: ImportPayload = serde_json::from_str(json).unwrap();
        assert!(matches!(payload, ImportPayload::Single(_)));
        assert_eq!(payload.sheets().len(), 1);
    }

    #[test]
    fn test_import_payload_multi_sheet_deserializes() {
        let json = r#"{"sheets": [
            {"name": "Feb. 2025", "data": {"month": 2, "year": 2025, "buildings": []}},
            {"name": "Mar. 2025", "data": {"month": 3, "year": 2025}}
        ]}"#;
        let payload: ImportPayload = serde_json::from_str(json).unwrap();
        assert!(matches!(payload, ImportPayload::Multi(_)));
        assert_eq!(payload.sheets().len(), 2);
        assert_eq!(payload.sheets()[1].month, 3);
    }

    #[test]
    fn test_reservation_draft_optional_fields_default() {
        let json = r#"{"date": "2025-03-01", "rate": 100.0}"#;
        let draft: ReservationDraft = serde_json::from_str(json).unwrap();
        assert!(draft.comment.is_none());
        assert!(draft.guest_name.is_none());
    }
}
