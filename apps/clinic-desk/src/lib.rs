//! Desk-side client for the clinic registration rendezvous: the staff
//! display session (device claim, token display, screen room) and the
//! patient registration flow driven from a scanned link.

pub mod api;
pub mod binder;
pub mod channel;
pub mod flow;
pub mod store;
