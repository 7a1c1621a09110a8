pub mod ledger;
pub mod primitives;
pub mod value;
