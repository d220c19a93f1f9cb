pub(super) const DEFAULT_PORT: u16 = 8080;

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "compact".to_string()
}

pub(super) fn default_listen(port: u16) -> String {
    format!("127.0.0.1:{}", port)
}
