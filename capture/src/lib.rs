//! Supervised recording of live streams.
//!
//! A [`session::SessionController`] probes a stream, records it through a
//! [`backend::CaptureBackend`] (in-process engine or an ffmpeg child), and
//! promotes the provisional output once each attempt ends.

pub mod backend;
pub mod finalize;
pub mod http;
pub mod muxer;
pub mod native;
pub mod probe;
pub mod session;
