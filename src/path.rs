//! Repository-relative path handling.
//!
//! Every path the browser holds or the commit builder writes into a tree goes
//! through [`normalize`]: slash-separated, no leading or trailing `/`, no empty
//! segments.  The empty string is the repository root.

/// Canonicalize a repository path.
///
/// `None`, `""` and `"/"` all map to the root (`""`).  Never fails.
pub fn normalize(path: Option<&str>) -> String {
    let path = match path {
        None | Some("") | Some("/") => return String::new(),
        Some(p) => p,
    };

    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join path segments in order, skipping empty and bare `"/"` segments.
///
/// Used to compute an upload destination: `join(&[current_path, file_name])`.
pub fn join<S: AsRef<str>>(segments: &[S]) -> String {
    let kept: Vec<&str> = segments
        .iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.is_empty() && *s != "/")
        .collect();

    if kept.is_empty() {
        return String::new();
    }

    normalize(Some(&kept.join("/")))
}

/// The parent of a normalized path, or `None` at the root.
pub fn parent(path: &str) -> Option<String> {
    let path = normalize(Some(path));
    if path.is_empty() {
        return None;
    }
    Some(match path.rfind('/') {
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    })
}

/// A single step in a path navigator: the segment label and the full path
/// that navigating to it loads.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Crumb {
    pub label: String,
    pub path: String,
}

/// Root first, then one crumb per segment of `path`.
pub fn breadcrumbs(path: &str) -> Vec<Crumb> {
    let path = normalize(Some(path));
    let mut crumbs = vec![Crumb {
        label: "Root".to_string(),
        path: String::new(),
    }];

    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        prefix = join(&[prefix.as_str(), segment]);
        crumbs.push(Crumb {
            label: segment.to_string(),
            path: prefix.clone(),
        });
    }
    crumbs
}
