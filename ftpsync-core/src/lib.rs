mod config;
mod metafile;
mod progress;
mod remote;

pub use config::{
    CONFIG_FILE_NAME, Config, ConfigError, DEFAULT_SETTINGS_TEMPLATE, Profile, WatchRule,
    fingerprint_for, load_config, parse_config, strip_line_comments, verify_profile,
};
pub use metafile::{
    DEFAULT_TIME_FORMAT, Metafile, mode_to_permissions, parse_permissions, permissions_to_octal,
};
pub use progress::{Progress, SharedProgress};
pub use remote::{BlockCallback, ConnectionFactory, RemoteConnection, RemoteError};
