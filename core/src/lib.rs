pub mod access;
pub mod cache;
pub mod controller;
pub mod db;
pub mod export;
pub mod extract;
pub mod insights;
pub mod models;
pub mod remote;
