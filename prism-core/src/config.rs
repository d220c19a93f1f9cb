mod defaults;
mod load;
mod types;
mod validate;

pub use load::{finalize_config, load_config, read_config};
pub use types::*;
pub use validate::validate_config;

#[cfg(test)]
mod tests;
