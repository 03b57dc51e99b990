pub mod backend;
pub mod cli;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod mnist;
pub mod model;
pub mod optim;
pub mod plot;
pub mod training;

pub use error::{Error, Result};
