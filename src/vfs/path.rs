//! Lexical path helpers
//!
//! None of these touch the node graph; symlinks are resolved by the VFS
//! walk, not here.

/// Collapse `.`, `..`, repeated and trailing slashes
///
/// `..` above the root stays at the root for absolute paths and is kept for
/// relative ones.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Everything before the last component
pub fn dirname(path: &str) -> String {
    let path = normalize(path);
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => ".".to_string(),
    }
}

/// The last component, empty for the root
pub fn basename(path: &str) -> String {
    let path = normalize(path);
    if path == "/" {
        return String::new();
    }
    match path.rfind('/') {
        Some(i) => path[i + 1..].to_string(),
        None => path,
    }
}

pub fn join(base: &str, name: &str) -> String {
    normalize(&format!("{}/{}", base, name))
}

/// Resolve `path` against `cwd` into a normalized absolute path
pub fn resolve(cwd: &str, path: &str) -> String {
    if is_absolute(path) {
        normalize(path)
    } else {
        normalize(&format!("{}/{}", cwd, path))
    }
}
