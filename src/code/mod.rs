pub mod generator;
pub mod ppc;
pub mod writer;
