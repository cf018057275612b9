pub mod aggregate;
pub mod key;
