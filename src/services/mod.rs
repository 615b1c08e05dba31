pub mod catalog;
pub mod disputes;
pub mod gateway;
pub mod ledger;
pub mod notify;
pub mod orders;
pub mod promo;
pub mod providers;
