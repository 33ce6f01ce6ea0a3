pub mod config;
pub mod messages;
pub mod sdp;

pub use config::*;
pub use messages::*;
pub use sdp::*;
