use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Server settings, read from an optional configuration file.  Every
/// option has a default, so the resolver can start with no
/// configuration at all.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Settings {
    /// Address to listen on.
    #[serde(default = "default_server_ip")]
    pub server_ip: Ipv4Addr,

    /// Port to listen on.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Address of the root nameserver every resolution starts from.
    #[serde(default = "default_root_server_ip")]
    pub root_server_ip: Ipv4Addr,

    /// Port of the root nameserver, also used for referral targets.
    #[serde(default = "default_root_server_port")]
    pub root_server_port: u16,

    /// UDP receive buffer size, in octets.
    #[serde(default = "default_request_size")]
    pub request_size: usize,

    /// Where the cache is persisted across restarts.
    #[serde(default = "default_cache_filepath")]
    pub cache_filepath: PathBuf,

    /// Seconds between sweeper passes over the cache.
    #[serde(default = "default_clean_period")]
    pub clean_period: u64,
}

impl Settings {
    pub fn new(filename: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(filename) = filename {
            builder = builder.add_source(File::with_name(filename));
        }
        builder.build()?.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_server_port(),
            root_server_ip: default_root_server_ip(),
            root_server_port: default_root_server_port(),
            request_size: default_request_size(),
            cache_filepath: default_cache_filepath(),
            clean_period: default_clean_period(),
        }
    }
}

fn default_server_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_server_port() -> u16 {
    53
}

/// a.root-servers.net
fn default_root_server_ip() -> Ipv4Addr {
    Ipv4Addr::new(198, 41, 0, 4)
}

fn default_root_server_port() -> u16 {
    53
}

fn default_request_size() -> usize {
    512
}

fn default_cache_filepath() -> PathBuf {
    PathBuf::from("cache.bin")
}

fn default_clean_period() -> u64 {
    60
}
