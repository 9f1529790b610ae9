pub mod config;
pub mod feed;
pub mod remote;
pub mod timing_stats;
