pub mod async_stream;
pub mod copy;
pub mod socket;
pub mod stream_reader;
