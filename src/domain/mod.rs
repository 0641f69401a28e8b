pub mod ledger;
pub mod models;
pub mod pricing;
pub mod rental_state;
pub mod store;
