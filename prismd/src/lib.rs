pub mod cgi;
pub mod cgi_response;
pub mod dispatcher;
pub mod error;
pub mod fastcgi;
pub mod handler;
pub mod listener;
pub mod path_info;
pub mod request;
pub mod rewrite;
pub mod variables;

/// Value of `SERVER_SOFTWARE` and the footer of generated pages.
pub const SERVER_SOFTWARE: &str = concat!("prismd/", env!("CARGO_PKG_VERSION"));
