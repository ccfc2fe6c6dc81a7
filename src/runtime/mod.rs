pub mod aggregator;
pub mod counter;
pub mod intake;
