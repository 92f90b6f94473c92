//! DAG builder
//! job config -> logical dag -> physical plan

pub mod logical_dag;
pub mod logical_plan;
pub mod physical_plan;
