//! Shared fixtures for service tests

use crate::services::workbook::SheetGrid;

const WEEKDAYS: [&str; 7] = ["Sa", "Do", "Lu", "Ma", "Mi", "Ju", "Vi"];

/// Header band for a month sheet with `days` day columns starting at C
pub fn sheet_with_header(name: &str, days: u32) -> SheetGrid {
    let mut grid = SheetGrid::new(name);
    for day in 1..=days {
        let col = day + 2;
        grid.set_value(4, col, WEEKDAYS[((day - 1) % 7) as usize]);
        grid.set_value(5, col, day.to_string());
    }
    grid
}

/// A small "Mar. 2025" ledger:
///
/// - TORRE MARINA: `A01 - Jane Doe` at 100 on Mar 1-3 and 120 on Mar 5,
///   `A02 - John Roe` at 80 on Mar 10-11
/// - LIMPIEZAS EXTERNAS: one cleaning row (excluded)
/// - OTROS APARTAMENTOS: `Casa Playa - Juan Perez` at 200 on Mar 2-3
pub fn march_ledger() -> SheetGrid {
    let mut grid = sheet_with_header("Mar. 2025", 31);

    grid.set_value(6, 1, "2").set_value(6, 2, "TORRE MARINA");
    grid.set_value(7, 1, "H");

    grid.set_value(8, 2, "A01 - Jane Doe");
    for col in 3..=5 {
        grid.set_value(8, col, "100");
    }
    grid.set_fill(8, 3, "FFFFC000")
        .set_comment(8, 3, "~Jane Guest // airbnb");
    grid.set_value(8, 7, "120");

    grid.set_value(9, 2, "A02 - John Roe");
    grid.set_value(9, 12, "80").set_value(9, 13, "80");
    grid.set_theme_fill(9, 12, 9);

    grid.set_value(10, 1, "1").set_value(10, 2, "LIMPIEZAS EXTERNAS");
    grid.set_value(11, 1, "H");
    grid.set_value(12, 2, "L1 - Cleaner").set_value(12, 3, "30");

    grid.set_value(13, 1, "1").set_value(13, 2, "OTROS APARTAMENTOS");
    grid.set_value(14, 1, "H");
    grid.set_value(15, 2, "Casa Playa - Juan Perez");
    grid.set_value(15, 4, "200").set_value(15, 5, "200");

    grid
}
