pub mod auth;
pub mod capture;
pub mod config;
pub mod model;
pub mod notify;
pub mod output;
pub mod room;
pub mod send;
pub mod store;
pub mod subscription;
pub mod sync;
