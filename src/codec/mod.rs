//! MQTT Packet Codec
//!
//! Client-side encoding and decoding for MQTT v3.1.1 and v5.0 packets.
//! The decoder reads what a broker sends; the encoder writes what a
//! subscribing client sends.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::{frame_length, Decoder};
pub use encode::Encoder;

pub(crate) use decode::Cursor;
pub(crate) use encode::{length_size, put_length};

/// Largest body the fixed header can describe (about 256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;
