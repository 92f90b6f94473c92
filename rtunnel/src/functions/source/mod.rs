pub mod vec_source;
