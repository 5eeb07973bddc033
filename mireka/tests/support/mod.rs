#![allow(dead_code)]

pub mod harness;

pub use harness::{Harness, Pop3Client};
