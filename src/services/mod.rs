//! Business logic services

pub mod apartment_locks;
pub mod colors;
pub mod continuity;
pub mod email_sender;
pub mod entity_builder;
pub mod job_history;
pub mod layout_parser;
pub mod orchestrator;
pub mod owner_reports;
pub mod reconciler;
pub mod reservation_query;
pub mod sheet_selector;
pub mod source;
pub mod store;
pub mod workbook;

#[cfg(test)]
pub mod memory_store;
#[cfg(test)]
pub mod testing;
