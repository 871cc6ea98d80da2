pub mod config;
pub mod error;
pub mod paths;
pub mod session;
pub mod source;

pub use config::{CONFIG_TEMPLATE as SPOTIFY_CONFIG_TEMPLATE, SpotifyProviderConfig};
pub use error::SpotifyError;
pub use paths::SPOTIFY_TOKEN_CACHE_FILE_NAME;
pub use session::SpotifySession;
pub use source::SpotifySource;
