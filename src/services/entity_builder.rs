//! Groups raw cell facts into building / apartment / reservation drafts

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::services::colors::meaning_of;
use crate::types::{
    ApartmentDraft, BuildingDraft, RawCellFact, ReservationDraft, SheetPayload, SheetReport,
};

static REFERENCE_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:#|\b(?i:ref|c[oó]digo)\b[.:]?)\s*([A-Z0-9]{6,})").unwrap()
});

/// Trim and collapse runs of whitespace
pub fn normalize_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Guest name from a cell comment: first line, leading `~` removed, cut at `//`.
pub fn guest_from_comment(comment: &str) -> Option<String> {
    let first_line = comment.lines().next()?;
    let name = first_line.trim().trim_start_matches('~');
    let name = name.split("//").next().unwrap_or(name);
    let name = normalize_label(name);
    (!name.is_empty()).then_some(name)
}

/// Explicit reservation code following `#`, `ref` or `código`
pub fn reference_from_comment(comment: &str) -> Option<String> {
    REFERENCE_CODE
        .captures(comment)
        .map(|caps| caps[1].to_string())
}

/// Payment source named in the comment, else implied by the cell color
pub fn channel_hint(comment: Option<&str>, color_hex: Option<&str>) -> Option<String> {
    if let Some(comment) = comment {
        let upper = comment.to_uppercase();
        if upper.contains("BOOKING") {
            return Some("Booking.com".to_string());
        }
        if upper.contains("AIRBNB") {
            return Some("Airbnb".to_string());
        }
        if upper.contains("VRBO") {
            return Some("VRBO".to_string());
        }
    }

    match color_hex.and_then(meaning_of)? {
        "Cliente Airbnb" => Some("Airbnb".to_string()),
        "Booking" => Some("Booking.com".to_string()),
        "Cliente VRBO" => Some("VRBO".to_string()),
        _ => None,
    }
}

fn draft_from_fact(fact: &RawCellFact) -> ReservationDraft {
    let comment = fact.comment.as_deref();
    ReservationDraft {
        date: fact.date,
        rate: fact.rate,
        color_hex: fact.color_hex.clone(),
        comment: fact.comment.clone(),
        guest_name: comment.and_then(guest_from_comment),
        reference_code: comment.and_then(reference_from_comment),
        channel: channel_hint(comment, fact.color_hex.as_deref()),
    }
}

/// Group facts by building, then by apartment label.
///
/// First-seen order is kept for buildings and apartments; reservations are
/// sorted by date and a repeated date keeps the last fact.
pub fn build(facts: &[RawCellFact]) -> Vec<BuildingDraft> {
    let mut buildings: Vec<BuildingDraft> = Vec::new();
    let mut building_idx: HashMap<String, usize> = HashMap::new();
    let mut apartment_idx: HashMap<(usize, String), usize> = HashMap::new();

    for fact in facts {
        let building_name = normalize_label(&fact.building);
        let b = *building_idx.entry(building_name.clone()).or_insert_with(|| {
            buildings.push(BuildingDraft {
                name: building_name.clone(),
                apartments: Vec::new(),
            });
            buildings.len() - 1
        });

        let raw_text = normalize_label(&fact.row_label);
        let building = &mut buildings[b];
        let a = *apartment_idx
            .entry((b, raw_text.clone()))
            .or_insert_with(|| {
                building.apartments.push(ApartmentDraft {
                    code: fact.apartment_code.as_deref().map(normalize_label),
                    owner: normalize_label(&fact.owner_label),
                    raw_text: raw_text.clone(),
                    reservations: Vec::new(),
                });
                building.apartments.len() - 1
            });

        let apartment = &mut building.apartments[a];
        let draft = draft_from_fact(fact);
        match apartment.reservations.iter_mut().find(|r| r.date == draft.date) {
            Some(existing) => {
                debug!("Duplicate cell for '{}' on {}, keeping the last", raw_text, draft.date);
                *existing = draft;
            }
            None => apartment.reservations.push(draft),
        }
    }

    for apartment in buildings.iter_mut().flat_map(|b| b.apartments.iter_mut()) {
        apartment.reservations.sort_by_key(|r| r.date);
    }

    buildings
}

/// Drafts of a whole parsed sheet
pub fn build_sheet(report: &SheetReport) -> SheetPayload {
    SheetPayload {
        month: report.month,
        year: report.year,
        buildings: build(&report.facts),
    }
}
