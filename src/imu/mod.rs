pub mod sample;

pub use sample::{INERTIAL_RATE_HZ, ImuSample};
