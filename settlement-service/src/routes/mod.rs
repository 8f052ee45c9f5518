mod admin;
mod bets;
mod health;
mod rounds;
mod settlement;
mod wallets;

pub use admin::*;
pub use bets::*;
pub use health::*;
pub use rounds::*;
pub use settlement::*;
pub use wallets::*;
