//! CLI arguments and server configuration defaults.

use clap::Parser;

use crate::admission::AdmissionPolicy;

pub const DEFAULT_ROOT_DIR: &str = "/var/www/html/files";
pub const DEFAULT_HTTP_PORT: u16 = 6012;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 8 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 8 * 1024 * 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_UPLOAD_MAX_CONCURRENT: u64 = 8;
pub const DEFAULT_SYMLINK_TARGET_PREFIX: &str = "/mnt";
pub const DEFAULT_TREE_HIDDEN_PREFIX: &str = "_h5ai";
pub const UPLOAD_RETRY_AFTER_SECS: u64 = 30;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;
/// 反向代理下的兼容路由前缀。
pub const ROUTE_PREFIX: &str = "/filesuploader";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "fileuploader", version, about = "Confined HTTP file manager")]
pub struct Args {
    #[arg(
        short = 'r',
        long,
        env = "FM_ROOT_DIR",
        default_value = DEFAULT_ROOT_DIR,
        help = "Root directory exposed by the file manager"
    )]
    pub root_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "FM_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FM_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        long,
        env = "FM_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "FM_MAX_REQUEST_SIZE",
        default_value_t = DEFAULT_MAX_REQUEST_SIZE,
        help = "Max size of an upload request body in bytes"
    )]
    pub max_request_size: u64,
    #[arg(
        long,
        env = "FM_READ_TIMEOUT_SECS",
        default_value_t = DEFAULT_READ_TIMEOUT_SECS,
        help = "Timeout for each read from an upload body"
    )]
    pub read_timeout_secs: u64,
    #[arg(
        long,
        env = "FM_WRITE_TIMEOUT_SECS",
        default_value_t = DEFAULT_WRITE_TIMEOUT_SECS,
        help = "Timeout for each write to an uploaded file"
    )]
    pub write_timeout_secs: u64,
    #[arg(
        long,
        env = "FM_UPLOAD_MAX_CONCURRENT",
        default_value_t = DEFAULT_UPLOAD_MAX_CONCURRENT,
        help = "Max concurrent uploads (0 to disable)"
    )]
    pub upload_max_concurrent: u64,
    #[arg(
        long,
        env = "FM_UPLOAD_ADMISSION",
        value_enum,
        default_value_t = AdmissionPolicy::Wait,
        help = "What to do with uploads beyond the concurrency limit"
    )]
    pub upload_admission: AdmissionPolicy,
    #[arg(
        long,
        env = "FM_SYMLINK_TARGET_PREFIX",
        default_value = DEFAULT_SYMLINK_TARGET_PREFIX,
        help = "Required prefix for symlink targets"
    )]
    pub symlink_target_prefix: String,
    #[arg(
        long,
        env = "FM_TREE_HIDDEN_PREFIX",
        default_value = DEFAULT_TREE_HIDDEN_PREFIX,
        help = "Entries starting with this prefix are left out of the directory tree"
    )]
    pub tree_hidden_prefix: String,
    #[arg(long, env = "FM_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FM_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is not set"
    )]
    pub log_level: String,
}
