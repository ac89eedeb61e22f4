// kiln-core/src/install/mod.rs
pub mod link;
pub mod receipt;

pub use link::{link_keg, LinkReport};
pub use receipt::write_receipt;
