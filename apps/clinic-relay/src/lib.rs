//! Rendezvous server for the clinic patient-registration flow: room-scoped
//! realtime token delivery plus the HTTP surface for tokens, device-doctor
//! mappings and registrations.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod rooms;
pub mod storage;
pub mod tokens;
pub mod websocket;
