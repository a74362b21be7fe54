pub mod attack;
pub mod codec;
pub mod corpus;
pub mod distinguishers;
pub mod error;
pub mod leakage_model;
pub mod trace;
pub mod tracer;
pub mod util;

pub use error::Error;
