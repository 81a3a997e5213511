pub mod admission;
pub mod calendar;
pub mod config;
pub mod desk;
pub mod flow;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod resolver;
pub mod store;
pub mod sweeper;
pub mod wal;
pub mod wire;
