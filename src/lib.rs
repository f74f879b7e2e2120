// Modules
pub mod analytics;
pub mod application;
pub mod backtest;
pub mod config;
pub mod consts;
pub mod docs;
pub mod error;
pub mod evolution;
pub mod frontier;
pub mod handlers;
pub mod jobs;
pub mod market_data;
pub mod portfolio;
pub mod report;
pub mod sampling;
pub mod statistics;
pub mod tickers;
pub mod web_app;

#[cfg(test)]
mod fixtures;
