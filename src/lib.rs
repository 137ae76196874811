pub mod camera;
pub mod config;
pub mod control;
pub mod drive;
pub mod filter;
pub mod stream;
pub mod web_server;
