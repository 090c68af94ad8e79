mod mirror;

pub use mirror::{LocalMirrorFactory, TransferError};
