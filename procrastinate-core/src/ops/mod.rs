pub mod admin;
pub mod defer;
pub mod fetch;
pub mod finish;
pub mod periodic;
