pub mod admin;
pub mod api;
pub mod audit;
pub mod category;
pub mod config;
pub mod coupon;
pub mod course;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod lesson;
pub mod order;
pub mod progress;
pub mod signing;
pub mod storage;
pub mod user;
pub mod utils;
