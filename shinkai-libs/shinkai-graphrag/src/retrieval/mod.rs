pub mod community_reports;
pub mod covariates;
pub mod entities;
pub mod relationships;
pub mod text_units;
