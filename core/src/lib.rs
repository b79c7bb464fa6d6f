pub mod db;
pub mod detection;
pub mod models;
pub mod nutrition;
pub mod reference_import;
pub mod resolver;
pub mod scan;
pub mod service;
pub mod vision;
