pub mod config;
pub mod dashboard;
pub mod proxy;
pub mod stats;
pub mod stratum;
pub mod upstream;
