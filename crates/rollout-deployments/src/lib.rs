//! Deployment pipeline services: generation, execution, monitoring and approvals

pub mod services;
pub mod test_utils;

pub use services::*;
