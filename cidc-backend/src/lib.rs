//! The CIDC API: clinical trial metadata, its relational mirror, upload
//! jobs, downloadable files and the data access that guards them.

pub mod access;
pub mod config;
pub mod db;
pub mod document;
pub mod manifest;
pub mod server;
pub mod storage;
pub mod sync;

pub use server::{disable_inactive_users, refresh_download_permissions, serve, sync_blobs};
