pub mod error_analysis;
pub mod integrity;
pub mod recovery;
pub mod rollback_controller;

pub use error_analysis::*;
pub use integrity::*;
pub use recovery::*;
pub use rollback_controller::*;
