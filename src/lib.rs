pub mod app;
pub mod assigner;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod handlers;
pub mod model;
pub mod service;
pub mod sms;
pub mod status;
pub mod validation;
