//! Read-only workbook grid
//!
//! The layout parser walks this grid instead of the spreadsheet library
//! directly, so sheets can be built in memory for tests and tooling.

use std::collections::HashMap;
use std::io::Cursor;

use tracing::debug;

use crate::error::ImportError;

/// Value, fill and annotation of one cell
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellData {
    pub value: String,
    pub fill_argb: Option<String>,
    pub fill_theme: Option<u32>,
    pub comment: Option<String>,
}

/// One worksheet; rows and columns are 1-based
#[derive(Debug, Clone, Default)]
pub struct SheetGrid {
    name: String,
    cells: HashMap<(u32, u32), CellData>,
    max_row: u32,
    max_col: u32,
}

impl SheetGrid {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_row(&self) -> u32 {
        self.max_row
    }

    pub fn max_col(&self) -> u32 {
        self.max_col
    }

    pub fn cell(&self, row: u32, col: u32) -> Option<&CellData> {
        self.cells.get(&(row, col))
    }

    /// Trimmed cell text; `None` for missing or blank cells
    pub fn text(&self, row: u32, col: u32) -> Option<&str> {
        self.cell(row, col)
            .map(|c| c.value.trim())
            .filter(|v| !v.is_empty())
    }

    fn cell_mut(&mut self, row: u32, col: u32) -> &mut CellData {
        self.max_row = self.max_row.max(row);
        self.max_col = self.max_col.max(col);
        self.cells.entry((row, col)).or_default()
    }

    pub fn set_value(&mut self, row: u32, col: u32, value: impl Into<String>) -> &mut Self {
        self.cell_mut(row, col).value = value.into();
        self
    }

    pub fn set_fill(&mut self, row: u32, col: u32, argb: impl Into<String>) -> &mut Self {
        self.cell_mut(row, col).fill_argb = Some(argb.into());
        self
    }

    pub fn set_theme_fill(&mut self, row: u32, col: u32, theme_index: u32) -> &mut Self {
        self.cell_mut(row, col).fill_theme = Some(theme_index);
        self
    }

    pub fn set_comment(&mut self, row: u32, col: u32, text: impl Into<String>) -> &mut Self {
        self.cell_mut(row, col).comment = Some(text.into());
        self
    }
}

/// All worksheets of a workbook, in tab order
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Vec<SheetGrid>,
}

impl Workbook {
    pub fn new(sheets: Vec<SheetGrid>) -> Self {
        Self { sheets }
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name()).collect()
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetGrid> {
        self.sheets.iter().find(|s| s.name() == name)
    }

    /// Load an `.xlsx` document, keeping values, solid fills and notes.
    pub fn from_xlsx_bytes(bytes: &[u8]) -> Result<Self, ImportError> {
        let book = umya_spreadsheet::reader::xlsx::read_reader(Cursor::new(bytes), true)
            .map_err(|e| ImportError::SourceUnavailable(format!("unreadable workbook: {}", e)))?;

        let mut sheets = Vec::new();
        for ws in book.get_sheet_collection() {
            let mut grid = SheetGrid::new(ws.get_name());

            for cell in ws.get_cell_collection() {
                let coordinate = cell.get_coordinate();
                let col = *coordinate.get_col_num();
                let row = *coordinate.get_row_num();

                let value = cell.get_value().to_string();
                if !value.is_empty() {
                    grid.set_value(row, col, value);
                }

                if let Some(color) = cell.get_style().get_background_color() {
                    let argb = color.get_argb();
                    if !argb.is_empty() {
                        grid.set_fill(row, col, argb);
                    } else {
                        grid.set_theme_fill(row, col, *color.get_theme_index());
                    }
                }
            }

            for comment in ws.get_comments() {
                let coordinate = comment.get_coordinate();
                let col = *coordinate.get_col_num();
                let row = *coordinate.get_row_num();
                // Only rich-text notes expose their text; Excel writes notes as runs
                let Some(rich) = comment.get_text().get_rich_text() else {
                    continue;
                };
                let text = rich.get_text().trim().to_string();
                if !text.is_empty() {
                    grid.set_comment(row, col, text);
                }
            }

            debug!(
                "Loaded sheet '{}' ({} rows x {} cols)",
                grid.name(),
                grid.max_row(),
                grid.max_col()
            );
            sheets.push(grid);
        }

        Ok(Self { sheets })
    }
}
