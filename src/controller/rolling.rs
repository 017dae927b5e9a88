pub mod deployer;
pub mod request;
pub mod validation;

pub use deployer::*;
pub use request::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "rolling_test.rs"]
mod tests;
