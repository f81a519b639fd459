//! Turns a live video byte stream into a sequence of image frames suitable
//! for downstream object detection, by piping through an external
//! transcoder process and splitting its output into self-delimited records.
//! All codec work is delegated to the transcoder; this crate owns the
//! streaming and concurrency layer in between.

pub mod error;
pub mod metadata;
pub mod mux;
pub mod pipeline;
pub mod realtime;
pub mod recognise;
pub mod split;
pub mod tee;
pub mod transcode;

pub use error::Error;
