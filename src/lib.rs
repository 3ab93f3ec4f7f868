pub mod collaborators;
pub mod config;
pub mod dag;
pub mod errors;
pub mod issue;
pub mod knowledge;
pub mod logging;
pub mod orchestrator;
pub mod selection;
pub mod util;

#[cfg(test)]
pub mod testing;
