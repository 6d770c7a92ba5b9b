//! Backend process plumbing: session lifecycle and the stream protocol

pub mod session;
pub mod stream;
