use super::*;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{fs, path::PathBuf};

fn unique_tmp_dir() -> PathBuf {
    let mut dir = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    dir.push(format!("prism-config-test-{}-{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

#[test]
fn load_config_resolves_paths_against_config_dir() {
    let dir = unique_tmp_dir();
    fs::create_dir_all(dir.join("www")).expect("mkdir www");
    let path = dir.join("prism.yaml");
    fs::write(
        &path,
        r#"
document_root: www
port: 8081
default_documents: [index.php, index.html]
invoke_on_extension:
  .php: php
invoke_on_path:
  - prefix: /app/
    application: php
rewrite_rules:
  - pattern: "^/post/(\\d+)$"
    replacement: "/post.php?id=${1}"
fastcgi_applications:
  php:
    socket: "127.0.0.1:9000"
logging:
  path: logs/prism.log
"#,
    )
    .expect("write config");

    let loaded = load_config(&path).expect("load config");
    let canonical_dir = fs::canonicalize(&dir).expect("canonicalize");
    fs::remove_dir_all(&dir).ok();

    assert_eq!(loaded.document_root, canonical_dir.join("www"));
    assert_eq!(loaded.port, 8081);
    assert_eq!(loaded.listen, vec!["127.0.0.1:8081".to_string()]);
    assert_eq!(
        loaded.invoke_on_extension.get("php").map(String::as_str),
        Some("php")
    );
    assert_eq!(loaded.rewrite_rules[0].replacement, "/post.php?id=${1}");
    assert_eq!(
        loaded.logging.path,
        Some(canonical_dir.join("logs/prism.log"))
    );
}

#[test]
fn load_config_defaults_document_root_to_config_dir() {
    let dir = unique_tmp_dir();
    let path = dir.join("prism.yaml");
    fs::write(&path, "allow_path_info: true\n").expect("write config");

    let loaded = load_config(&path).expect("load config");
    let canonical_dir = fs::canonicalize(&dir).expect("canonicalize");
    fs::remove_dir_all(&dir).ok();

    assert_eq!(loaded.document_root, canonical_dir);
    assert_eq!(loaded.port, 8080);
    assert!(loaded.allow_path_info);
}

#[test]
fn escaped_placeholder_keeps_named_capture_reference() {
    let dir = unique_tmp_dir();
    let path = dir.join("prism.yaml");
    fs::write(
        &path,
        r#"
rewrite_rules:
  - pattern: "^/tag/(?P<slug>[a-z]+)$"
    replacement: "/tags.php?slug=$${slug}&raw=${1}"
"#,
    )
    .expect("write config");

    let loaded = load_config(&path).expect("load config");
    fs::remove_dir_all(&dir).ok();

    assert_eq!(
        loaded.rewrite_rules[0].replacement,
        "/tags.php?slug=${slug}&raw=${1}"
    );
}

#[test]
fn load_config_rejects_unknown_keys() {
    let dir = unique_tmp_dir();
    let path = dir.join("prism.yaml");
    fs::write(&path, "alow_path_info: true\n").expect("write config");

    let err = load_config(&path).expect_err("unknown key must fail");
    fs::remove_dir_all(&dir).ok();

    assert!(err.to_string().contains("alow_path_info"), "{err}");
}

#[test]
fn validate_reports_every_problem() {
    let dir = unique_tmp_dir();
    let mut config = Config {
        document_root: dir.clone(),
        listen: vec!["not an address".to_string()],
        rewrite_rules: vec![RewriteRuleConfig {
            pattern: "(".to_string(),
            replacement: "/".to_string(),
        }],
        ..Config::default()
    };
    config
        .invoke_on_extension
        .insert("php".to_string(), "missing".to_string());
    config.cgi_applications.insert(
        "dup".to_string(),
        ApplicationConfig {
            path: PathBuf::from("/usr/bin/env"),
            ..ApplicationConfig::default()
        },
    );
    config.fastcgi_applications.insert(
        "dup".to_string(),
        FastCgiApplicationConfig {
            socket: String::new(),
            launch: None,
        },
    );

    let err = validate_config(&config).expect_err("invalid config");
    fs::remove_dir_all(&dir).ok();
    let msg = err.to_string();

    assert!(msg.contains("invalid listen address"), "{msg}");
    assert!(msg.contains("invalid rewrite pattern"), "{msg}");
    assert!(msg.contains("unknown application missing"), "{msg}");
    assert!(msg.contains("dup is defined as both"), "{msg}");
    assert!(msg.contains("has no socket defined"), "{msg}");
}

#[test]
fn finalize_applies_defaults_and_strips_extension_dots() {
    let dir = unique_tmp_dir();
    let mut config = Config::default();
    config
        .invoke_on_extension
        .insert(".cgi-app".to_string(), "runner".to_string());
    config.cgi_applications.insert(
        "runner".to_string(),
        ApplicationConfig {
            path: PathBuf::from("/bin/sh"),
            ..ApplicationConfig::default()
        },
    );

    finalize_config(&mut config, &dir).expect("finalize");
    fs::remove_dir_all(&dir).ok();

    assert_eq!(config.document_root, dir);
    assert_eq!(config.port, 8080);
    assert_eq!(config.listen, vec!["127.0.0.1:8080".to_string()]);
    assert!(config.invoke_on_extension.contains_key("cgi-app"));
}
