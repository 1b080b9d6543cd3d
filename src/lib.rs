pub mod params;
pub mod error;
pub mod grid;
pub mod correlation;
pub mod survey;
pub mod jackknife;
pub mod random_draws;
pub mod accumulator;
pub mod angular;
pub mod legendre;
pub mod power;
pub mod mc_integration;
