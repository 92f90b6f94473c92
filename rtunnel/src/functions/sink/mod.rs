pub mod collect;
pub mod print;
