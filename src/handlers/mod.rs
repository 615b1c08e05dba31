pub mod health;
pub mod orders;
pub mod promo;
pub mod wallet;
