//! Type definitions

pub mod entities;
pub mod import_job;
pub mod messages;
pub mod report;
pub mod sheet;

pub use entities::*;
pub use import_job::*;
pub use messages::*;
pub use report::*;
pub use sheet::*;
