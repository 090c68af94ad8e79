pub mod context;
pub mod prompt;
pub mod settings;
pub mod status;
pub mod sync;
pub mod transport;
