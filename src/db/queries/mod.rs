//! Database queries

pub mod color;
pub mod import_log;
pub mod report;
pub mod reservation;

pub use reservation::PgStore;
