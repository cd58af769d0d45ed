pub mod engine;
pub mod faker;
pub mod poa;
pub mod pow;

pub use engine::*;
pub use faker::Faker;
pub use poa::{Poa, PoaConfig};
pub use pow::Pow;
