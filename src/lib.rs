pub mod api;
pub mod borrow;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod model;
