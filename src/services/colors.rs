//! Cell color normalization and the ledger's color legend

use crate::types::ColorMeaning;

/// One legend entry: canonical RGB, optional theme index, meaning
#[derive(Debug, Clone, Copy)]
pub struct LegendEntry {
    pub rgb_hex: &'static str,
    pub theme_index: Option<u32>,
    pub meaning: &'static str,
}

/// Colors the ledger maintainers use, and what they mean
pub const COLOR_LEGEND: &[LegendEntry] = &[
    LegendEntry { rgb_hex: "#FF6B6B", theme_index: Some(5), meaning: "Pendiente de pago" },
    LegendEntry { rgb_hex: "#FFC000", theme_index: Some(7), meaning: "Cliente Airbnb" },
    LegendEntry { rgb_hex: "#2F75B5", theme_index: Some(4), meaning: "Larga estadia" },
    LegendEntry { rgb_hex: "#2F75B5", theme_index: Some(8), meaning: "Larga estadia" },
    LegendEntry { rgb_hex: "#F408FC", theme_index: Some(6), meaning: "Apto no disponible" },
    LegendEntry { rgb_hex: "#00FFFF", theme_index: None, meaning: "Cliente referido" },
    LegendEntry { rgb_hex: "#757171", theme_index: Some(0), meaning: "Mantenimiento" },
    LegendEntry { rgb_hex: "#548235", theme_index: Some(9), meaning: "Booking" },
    LegendEntry { rgb_hex: "#29E817", theme_index: None, meaning: "Cliente VRBO" },
];

/// Normalize a cell fill to `#RRGGBB`.
///
/// An explicit ARGB/RGB value wins; otherwise a theme index is resolved through
/// the legend. Transparent black (`00000000`) and unknown themes yield `None`.
pub fn normalize_fill(argb: Option<&str>, theme_index: Option<u32>) -> Option<String> {
    if let Some(raw) = argb.map(str::trim).filter(|s| !s.is_empty()) {
        let raw = raw.trim_start_matches('#');
        if raw.eq_ignore_ascii_case("00000000") {
            return None;
        }
        if !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        return match raw.len() {
            8 => Some(format!("#{}", raw[2..].to_uppercase())),
            6 => Some(format!("#{}", raw.to_uppercase())),
            _ => None,
        };
    }

    theme_index.and_then(|idx| {
        COLOR_LEGEND
            .iter()
            .find(|e| e.theme_index == Some(idx))
            .map(|e| e.rgb_hex.to_string())
    })
}

/// Meaning of a normalized color, if it is part of the legend
pub fn meaning_of(rgb_hex: &str) -> Option<&'static str> {
    COLOR_LEGEND
        .iter()
        .find(|e| e.rgb_hex.eq_ignore_ascii_case(rgb_hex))
        .map(|e| e.meaning)
}

/// Distinct legend colors for seeding the lookup table
pub fn legend_rows() -> Vec<ColorMeaning> {
    let mut rows: Vec<ColorMeaning> = Vec::new();
    for entry in COLOR_LEGEND {
        if !rows.iter().any(|row| row.rgb_hex == entry.rgb_hex) {
            rows.push(ColorMeaning {
                rgb_hex: entry.rgb_hex.to_string(),
                meaning: entry.meaning.to_string(),
            });
        }
    }
    rows
}
