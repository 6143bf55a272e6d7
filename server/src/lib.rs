//! Push hub server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod chat;
pub mod config;
pub mod db;
pub mod hub;
pub mod longpoll;
pub mod presence;
pub mod routes;
pub mod state;
pub mod sync;
pub mod ws;
