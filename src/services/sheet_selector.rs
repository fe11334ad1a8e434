//! Sheet selection
//!
//! Month sheets are named `"<MonthAbbr>. <Year>"`, e.g. `"Mar. 2025"`.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which worksheets an import run processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetSelection {
    /// Exactly this sheet
    Named(String),
    /// Every sheet with a recognised month/year name
    All,
    /// The last N months, current month included
    LastMonths(u32),
}

/// A worksheet chosen for import, with the month it covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedSheet {
    pub name: String,
    pub year: i32,
    pub month: u32,
}

static SHEET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z]{3})\.?\s*(\d{4})\s*$").unwrap());

/// Month number of a three-letter abbreviation (Spanish, plus English aliases)
pub fn month_from_abbr(abbr: &str) -> Option<u32> {
    let month = match abbr.to_lowercase().as_str() {
        "ene" | "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "abr" | "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "ago" | "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dic" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// `(year, month)` of a month sheet name, `None` for any other sheet
pub fn parse_sheet_month(name: &str) -> Option<(i32, u32)> {
    let caps = SHEET_NAME.captures(name)?;
    let month = month_from_abbr(&caps[1])?;
    let year = caps[2].parse::<i32>().ok()?;
    Some((year, month))
}

/// Months between `(year, month)` and `today`; negative for future sheets
fn months_back(year: i32, month: u32, today: NaiveDate) -> i64 {
    (today.year() - year) as i64 * 12 + (today.month() as i64 - month as i64)
}

/// Resolve the work list of a run, oldest sheet first.
pub fn select_sheets(
    sheet_names: &[&str],
    selection: &SheetSelection,
    today: NaiveDate,
) -> Vec<SelectedSheet> {
    let mut selected: Vec<SelectedSheet> = sheet_names
        .iter()
        .filter_map(|name| {
            let (year, month) = parse_sheet_month(name)?;
            let keep = match selection {
                SheetSelection::Named(wanted) => name.trim() == wanted.trim(),
                SheetSelection::All => true,
                SheetSelection::LastMonths(n) => {
                    let back = months_back(year, month, today);
                    back >= 0 && back < *n as i64
                }
            };
            keep.then(|| SelectedSheet {
                name: name.to_string(),
                year,
                month,
            })
        })
        .collect();

    selected.sort_by_key(|s| (s.year, s.month));
    selected
}
