#![deny(unused_must_use)]

pub mod action;
pub mod editor;
pub mod geometry;
pub mod index;
pub mod io;
pub mod las;
pub mod lru_cache;
pub mod point;
pub mod query;
mod trace_utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use nalgebra;
