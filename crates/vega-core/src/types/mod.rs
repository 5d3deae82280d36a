//! Core data types, enums, and market data structures.

pub mod enums;
pub mod instrument;
pub mod market_data;
pub mod trading;

pub use enums::*;
pub use instrument::*;
pub use market_data::*;
pub use trading::*;
