//! Ledger layout parser
//!
//! A month sheet carries a header band (weekdays in row 4, day numbers in
//! row 5, from column C) followed by building blocks:
//!
//! ```text
//!   A        B                      C    D    E   ...
//!   12       TORRE MARINA                               <- building row
//!   H                                                   <- marker row
//!            A01 - Jane Doe         100  100            <- apartment rows
//!            A02 - John Roe                   80
//! ```
//!
//! Every non-empty (apartment row, date column) cell becomes a `RawCellFact`.

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{cell_ref, ImportError};
use crate::services::colors::normalize_fill;
use crate::services::sheet_selector::parse_sheet_month;
use crate::services::workbook::{SheetGrid, Workbook};
use crate::types::{CellWarning, LayoutPolicy, LayoutRules, RawCellFact, SheetReport};

const DAY_ROW: u32 = 5;
const FIRST_DATE_COL: u32 = 3;
const MAX_DATE_COLUMNS: u32 = 31;
const FIRST_BLOCK_ROW: u32 = 6;
const BLOCK_MARKER: &str = "H";

/// Parses month sheets of the reservation ledger
#[derive(Debug, Clone, Default)]
pub struct LayoutParser {
    rules: LayoutRules,
}

/// A building block found in the sheet
#[derive(Debug, Clone, PartialEq)]
struct BuildingBlock {
    name: String,
    first_row: u32,
    last_row: u32,
}

impl LayoutParser {
    pub fn new(rules: LayoutRules) -> Self {
        Self { rules }
    }

    /// Parse one named sheet of the workbook.
    pub fn parse(&self, workbook: &Workbook, sheet_name: &str) -> Result<SheetReport, ImportError> {
        let grid = workbook
            .sheet(sheet_name)
            .ok_or_else(|| ImportError::sheet_parse(sheet_name, "sheet not found in workbook"))?;
        self.parse_grid(grid)
    }

    pub fn parse_grid(&self, grid: &SheetGrid) -> Result<SheetReport, ImportError> {
        let sheet_name = grid.name();
        let (year, month) = parse_sheet_month(sheet_name).ok_or_else(|| {
            ImportError::sheet_parse(sheet_name, "name is not a '<Mon>. <Year>' month sheet")
        })?;

        let mut warnings = Vec::new();
        let date_columns = read_header(grid, year, month, &mut warnings);
        if date_columns.is_empty() {
            return Err(ImportError::sheet_parse(
                sheet_name,
                format!("missing header band: no day numbers in row {}", DAY_ROW),
            ));
        }

        let blocks = find_blocks(grid);
        if blocks.is_empty() {
            return Err(ImportError::sheet_parse(sheet_name, "no building blocks found"));
        }

        let mut facts = Vec::new();
        let mut buildings_skipped = 0;

        for block in &blocks {
            let policy = self.rules.classify(&block.name);
            if policy == LayoutPolicy::Excluded {
                info!("Skipping excluded building '{}' in '{}'", block.name, sheet_name);
                buildings_skipped += 1;
                continue;
            }

            for row in block.first_row..=block.last_row {
                let Some(label) = grid.text(row, 2) else {
                    debug!("Row {} of '{}' has no apartment label", row, block.name);
                    continue;
                };
                let (apartment_code, owner_label) = split_row_label(label, policy);

                for &(col, date) in &date_columns {
                    let Some(cell) = grid.cell(row, col) else {
                        continue;
                    };
                    let raw = cell.value.trim();
                    if raw.is_empty() {
                        continue;
                    }

                    let rate = match parse_rate(raw) {
                        Ok(Some(rate)) => rate,
                        Ok(None) => continue,
                        Err(reason) => {
                            let err = ImportError::validation(cell_ref(row, col), reason);
                            debug!("{}", err);
                            warnings.push(CellWarning {
                                cell: cell_ref(row, col),
                                message: err.to_string(),
                            });
                            continue;
                        }
                    };

                    facts.push(RawCellFact {
                        building: block.name.clone(),
                        policy,
                        row_label: label.to_string(),
                        apartment_code: apartment_code.clone(),
                        owner_label: owner_label.clone(),
                        date,
                        rate,
                        comment: cell
                            .comment
                            .as_deref()
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(str::to_string),
                        color_hex: normalize_fill(cell.fill_argb.as_deref(), cell.fill_theme),
                        row,
                        col,
                    });
                }
            }
        }

        if !warnings.is_empty() {
            warn!("Sheet '{}': {} cells skipped", sheet_name, warnings.len());
        }
        info!(
            "Parsed sheet '{}': {} facts from {} buildings ({} skipped)",
            sheet_name,
            facts.len(),
            blocks.len(),
            buildings_skipped
        );

        Ok(SheetReport {
            sheet_name: sheet_name.to_string(),
            month,
            year,
            facts,
            warnings,
            buildings_seen: blocks.len(),
            buildings_skipped,
        })
    }
}

/// Date columns of the header band; bad day numbers become warnings
fn read_header(
    grid: &SheetGrid,
    year: i32,
    month: u32,
    warnings: &mut Vec<CellWarning>,
) -> Vec<(u32, NaiveDate)> {
    let last_col = grid.max_col().min(FIRST_DATE_COL + MAX_DATE_COLUMNS - 1);
    let mut columns = Vec::new();

    for col in FIRST_DATE_COL..=last_col {
        let Some(raw) = grid.text(DAY_ROW, col) else {
            continue;
        };
        match parse_day(raw).and_then(|day| NaiveDate::from_ymd_opt(year, month, day)) {
            Some(date) => columns.push((col, date)),
            None => warnings.push(CellWarning {
                cell: cell_ref(DAY_ROW, col),
                message: ImportError::validation(
                    cell_ref(DAY_ROW, col),
                    format!("'{}' is not a day of {}-{:02}", raw, year, month),
                )
                .to_string(),
            }),
        }
    }

    columns
}

fn parse_day(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if let Ok(day) = raw.parse::<u32>() {
        return Some(day);
    }
    let value = raw.parse::<f64>().ok()?;
    (value.fract() == 0.0 && value >= 1.0 && value <= 31.0).then_some(value as u32)
}

fn parse_count(raw: Option<&str>) -> Option<u32> {
    let raw = raw?.trim();
    raw.parse::<u32>().ok().or_else(|| {
        let value = raw.parse::<f64>().ok()?;
        (value.fract() == 0.0 && value >= 0.0).then_some(value as u32)
    })
}

/// Apartment count in column A, a name in column B, the `H` marker below
fn is_building_row(grid: &SheetGrid, row: u32) -> bool {
    parse_count(grid.text(row, 1)).is_some()
        && grid.text(row, 2).is_some()
        && grid
            .text(row + 1, 1)
            .is_some_and(|m| m.eq_ignore_ascii_case(BLOCK_MARKER))
}

fn find_blocks(grid: &SheetGrid) -> Vec<BuildingBlock> {
    let max_row = grid.max_row();
    let starts: Vec<u32> = (FIRST_BLOCK_ROW..=max_row)
        .filter(|&row| is_building_row(grid, row))
        .collect();

    starts
        .iter()
        .enumerate()
        .filter_map(|(i, &start)| {
            let name = grid.text(start, 2)?.to_string();
            let first_row = start + 2;
            let boundary = starts.get(i + 1).map(|next| next - 1).unwrap_or(max_row);

            let count = parse_count(grid.text(start, 1))?;
            let last_row = (first_row + count).saturating_sub(1).min(boundary);

            (last_row >= first_row).then_some(BuildingBlock {
                name,
                first_row,
                last_row,
            })
        })
        .collect()
}

/// Split an apartment row label into `(code, owner)` according to the policy.
pub fn split_row_label(label: &str, policy: LayoutPolicy) -> (Option<String>, String) {
    let label = label.trim();
    match policy {
        LayoutPolicy::Miscellaneous => (None, label.to_string()),
        LayoutPolicy::Standard | LayoutPolicy::Excluded => match label.rfind('-') {
            Some(idx) => {
                let code = label[..idx].trim();
                let owner = label[idx + 1..].trim();
                let code = if code.is_empty() { label } else { code };
                (Some(code.to_string()), owner.to_string())
            }
            None => (Some(label.to_string()), String::new()),
        },
    }
}

/// Parse a nightly rate cell.
///
/// Currency symbols and whitespace are ignored. When both `,` and `.` occur
/// the later one is the decimal separator. `Ok(None)` means "no rate".
pub fn parse_rate(raw: &str) -> Result<Option<f64>, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | '£') && !c.is_whitespace())
        .collect();

    if cleaned.is_empty() || cleaned == "-" || cleaned.eq_ignore_ascii_case("false") {
        return Ok(None);
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');

    let normalized = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) => {
            if comma > dot {
                cleaned.replace('.', "").replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) => {
            if is_grouped(&cleaned, ',') {
                cleaned.replace(',', "")
            } else if cleaned.matches(',').count() == 1 {
                cleaned.replace(',', ".")
            } else {
                return Err(format!("'{}' is not a rate", raw.trim()));
            }
        }
        (None, Some(_)) => {
            if cleaned.matches('.').count() > 1 && is_grouped(&cleaned, '.') {
                cleaned.replace('.', "")
            } else {
                cleaned
            }
        }
        (None, None) => cleaned,
    };

    match normalized.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(format!("'{}' is not a rate", raw.trim())),
    }
}

/// `1,250` / `1,250,000` style digit grouping
fn is_grouped(s: &str, sep: char) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let mut groups = digits.split(sep);
    let Some(head) = groups.next() else {
        return false;
    };
    let head_ok = (1..=3).contains(&head.len()) && head.chars().all(|c| c.is_ascii_digit());
    let mut rest = groups.peekable();
    head_ok
        && rest.peek().is_some()
        && rest.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}
