use std::path::Path;

/// Result of splitting a URL path into a script and its path info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfoSplit {
    /// Always starts with `/`.
    pub script_path: String,
    pub path_info: String,
}

/// Walk `url_path` segment by segment below `document_root`.
///
/// The walk stops at the first segment that is a file: that prefix becomes
/// the script path and the remainder, starting at its `/`, the path info.
/// A path naming the script exactly gets an empty path info, not `/`, so
/// `PATH_INFO` is left unset for it. Directories are descended into. A
/// segment that does not exist ends the walk with what was accumulated so far
/// and no path info; serving that path is left to the handler, which reports
/// 404.
pub fn resolve_path_info(document_root: &Path, url_path: &str) -> PathInfoSplit {
    let mut script_path = String::new();
    let mut offset = 0usize;

    for piece in url_path.split_inclusive('/') {
        offset += piece.len();
        let segment = piece.trim_end_matches('/');
        if segment.is_empty() {
            continue;
        }
        script_path.push('/');
        script_path.push_str(segment);
        if segment == ".." {
            break;
        }

        let on_disk = document_root.join(&script_path[1..]);
        if on_disk.is_file() {
            let rest_start = if piece.ends_with('/') { offset - 1 } else { offset };
            return PathInfoSplit {
                script_path,
                path_info: url_path[rest_start..].to_string(),
            };
        }
        if !on_disk.is_dir() {
            break;
        }
    }

    if script_path.is_empty() {
        script_path.push('/');
    }
    PathInfoSplit {
        script_path,
        path_info: String::new(),
    }
}
