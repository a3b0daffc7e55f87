pub mod analysis;
pub mod irdb;
pub mod lir;
