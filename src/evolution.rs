pub mod individual;
pub mod objective;
pub mod portfolio_evolution;
