pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod routes;
pub mod storage;
pub mod upload;
