pub mod action;
pub mod checkpoint;
pub mod cluster;
pub mod config;
pub mod connector;
pub mod element;
pub mod error;
pub mod factory;
pub mod properties;
pub mod runtime;
pub mod split;
