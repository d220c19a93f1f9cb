use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::HashSet;
use std::net::SocketAddr;

use super::types::*;

/// Check a finalized config. All problems are reported in one error.
pub fn validate_config(config: &Config) -> Result<()> {
    let mut errors = Vec::new();
    validate_document_root(config, &mut errors);
    validate_listeners(config, &mut errors);
    let applications = validate_applications(config, &mut errors);
    validate_routes(config, &applications, &mut errors);
    validate_rewrite_rules(&config.rewrite_rules, &mut errors);
    validate_logging(&config.logging, &mut errors);

    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("invalid configuration:\n  {}", errors.join("\n  ")))
}

fn validate_document_root(config: &Config, errors: &mut Vec<String>) {
    if !config.document_root.is_dir() {
        errors.push(format!(
            "document root {} does not exist or is not a directory",
            config.document_root.display()
        ));
    }
}

fn validate_listeners(config: &Config, errors: &mut Vec<String>) {
    if config.listen.is_empty() {
        errors.push("no listen addresses configured".to_string());
    }
    for listen in &config.listen {
        if let Err(e) = listen.parse::<SocketAddr>() {
            errors.push(format!("invalid listen address '{}': {}", listen, e));
        }
    }
}

fn validate_applications<'a>(config: &'a Config, errors: &mut Vec<String>) -> HashSet<&'a str> {
    let mut names = HashSet::new();
    for (name, app) in &config.cgi_applications {
        names.insert(name.as_str());
        if app.path.as_os_str().is_empty() {
            errors.push(format!("CGI application {} has no path", name));
        }
    }
    for (name, app) in &config.fastcgi_applications {
        if !names.insert(name.as_str()) {
            errors.push(format!("{} is defined as both a CGI and a FastCGI application", name));
        }
        if app.socket.trim().is_empty() {
            errors.push(format!("FastCGI application {} has no socket defined", name));
        }
        if let Some(launch) = app.launch.as_ref() {
            if launch.path.as_os_str().is_empty() {
                errors.push(format!("FastCGI application {} has an empty launch path", name));
            }
        }
    }
    names
}

fn validate_routes(config: &Config, applications: &HashSet<&str>, errors: &mut Vec<String>) {
    let mut extensions: Vec<_> = config.invoke_on_extension.iter().collect();
    extensions.sort();
    for (extension, application) in extensions {
        if extension.is_empty() {
            errors.push(format!("application {} is assigned to an empty extension", application));
        }
        if !applications.contains(application.as_str()) {
            errors.push(format!(
                "extension {} has unknown application {} assigned to it",
                extension, application
            ));
        }
    }
    for route in &config.invoke_on_path {
        if !route.prefix.starts_with('/') {
            errors.push(format!("path prefix {} must start with '/'", route.prefix));
        }
        if !applications.contains(route.application.as_str()) {
            errors.push(format!(
                "path {} has unknown application {} assigned to it",
                route.prefix, route.application
            ));
        }
    }
}

fn validate_rewrite_rules(rules: &[RewriteRuleConfig], errors: &mut Vec<String>) {
    for rule in rules {
        if let Err(e) = Regex::new(&rule.pattern) {
            errors.push(format!("invalid rewrite pattern '{}': {}", rule.pattern, e));
        }
    }
}

fn validate_logging(logging: &LoggingConfig, errors: &mut Vec<String>) {
    let format = logging.format.to_ascii_lowercase();
    if !matches!(format.as_str(), "json" | "compact" | "pretty") {
        errors.push(format!(
            "logging.format must be one of json, compact, pretty (got {})",
            logging.format
        ));
    }
    if logging.level.trim().is_empty() {
        errors.push("logging.level must not be empty".to_string());
    }
}
