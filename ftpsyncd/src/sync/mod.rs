pub mod backoff;
pub mod cache;
pub mod check;
pub mod command;
pub mod engine;
pub mod file_watcher;
pub mod local_watcher;
pub mod navigator;
pub mod paths;
pub mod queue;
pub mod scan;
pub mod worker;

#[cfg(test)]
mod test_support;
