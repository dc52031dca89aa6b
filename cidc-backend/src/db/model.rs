pub mod downloadable_file;
pub mod permission;
pub mod relational;
pub mod trial;
pub mod upload_job;
pub mod user;
