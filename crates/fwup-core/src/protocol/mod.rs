//! Protocol module - update service definitions.

pub mod constants;
pub mod wire;

pub use constants::*;
pub use wire::{Chunk, WireError, decode_u32, encode_u32};
