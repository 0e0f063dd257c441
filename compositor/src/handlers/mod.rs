//! Smithay protocol handlers for the globals the display advertises.

mod compositor;
mod seat;
mod shm;
