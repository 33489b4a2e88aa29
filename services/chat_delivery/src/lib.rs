pub mod api;
pub mod auth;
pub mod channels;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod members;
pub mod messages;
pub mod model;
pub mod notifications;
pub mod presence;
pub mod receipts;
pub mod service;
pub mod session;
pub mod store;
pub mod ws;
