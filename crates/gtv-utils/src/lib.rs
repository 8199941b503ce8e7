mod arrayvec;
mod ring_buffer;

pub use arrayvec::{ArrayStr, ArrayVec};
pub use ring_buffer::RingBuffer;
