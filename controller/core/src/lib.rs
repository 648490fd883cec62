#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admission;
pub mod gateway;
pub mod identity;
pub mod reconcile;
pub mod secrets;

pub use self::identity::{hash_secret_data, hash_spec, is_hash_like, label_for};
