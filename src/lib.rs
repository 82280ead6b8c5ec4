//! Headless chat widget for the student forum.
//!
//! The widget core consists of two pieces: [`suggestions`] finds the quick-reply
//! chips in a chatbot reply (plain or protobuf-`Struct` encoded, see
//! [`proto_value`]), and [`greeting`] blinks the greeting bubble while the
//! widget sits closed and unused. [`widget`] ties them to a conversation and
//! [`server`] exposes widgets to browsers over HTTP and a WebSocket.

pub mod backend;
pub mod config;
pub mod error;
pub mod greeting;
pub mod proto_value;
pub mod realtime;
pub mod server;
pub mod suggestions;
pub mod types;
pub mod widget;
