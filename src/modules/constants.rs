use std::time::Duration;

// Plugin identity
pub const DEFAULT_SOCKET_PATH: &str = "/run/docker/plugins/keywhiz.sock";
pub const DEFAULT_VOLUMES_ROOT: &str = "/var/lib/docker-volumes/_keywhiz";
pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1+json";

// Timeout budget
pub const FRESH_THRESHOLD: Duration = Duration::from_millis(200);
pub const BACKEND_DEADLINE: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

// Mountpoint directories are owner-only
pub const MOUNTPOINT_PERMISSION: u32 = 0o700;
pub const PARENT_PERMISSION: u32 = 0o755;

// Teardown
pub const SERVE_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const FUSERMOUNT_HELPERS: [&str; 2] = ["fusermount", "fusermount3"];

// File system constants
pub const TTL: Duration = Duration::from_secs(1);
pub const BLOCK_SIZE: u64 = 512;
pub const ROOT_PERMISSION: u16 = 0o755;
pub const FILE_PERMISSION: u16 = 0o444;
pub const ROOT_INODE: u64 = 1;
pub const INITIAL_INODE: u64 = 2;

// Backend health endpoint
pub const STATUS_ENDPOINT: &str = "_status";
