pub mod config;
pub mod export;
pub mod hierarchy;
pub mod links;
pub mod menu;
pub mod migrate;
pub mod model;
pub mod rewrite;
pub mod runtime;
pub mod site;
pub mod source;
pub mod store;

#[cfg(test)]
pub(crate) mod fixtures;
