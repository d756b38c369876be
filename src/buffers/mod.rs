pub mod frame;
pub mod ring_buffer;
