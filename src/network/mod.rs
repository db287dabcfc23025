//! Network subsystem: MJPEG over HTTP and UDP discovery

pub mod addr;
pub mod client;
pub mod discovery;
pub mod parser;
pub mod server;

pub use addr::local_ip;
pub use client::{ClientStats, ClientStopHandle, StreamClient, StreamEnd};
pub use discovery::{Announcer, AnnouncerConfig, Discovery};
pub use parser::MjpegParser;
pub use server::{JpegFeed, StreamServer};
