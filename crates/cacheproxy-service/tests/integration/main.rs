// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod admission;
pub mod coalescing;
pub mod responses;
pub mod utils;

pub use utils::*;
