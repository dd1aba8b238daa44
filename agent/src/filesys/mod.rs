pub mod dir;
pub mod fifo;
pub mod file;
