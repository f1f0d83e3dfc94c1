//! Best-effort guess of a world's server flavour from its directory listing.
//!
//! Nothing in the coordination protocol depends on this; it only labels
//! entries when listing what is available in storage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of the mod loader's per-version library directories, relative
/// to the world root.
pub const FORGE_LIBRARIES_DIR: &str = "libraries/net/minecraftforge/forge/";
pub const VERSIONS_DIR: &str = "versions/";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Forge,
    Vanilla,
    Unknown,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerKind::Forge => "forge",
            ServerKind::Vanilla => "vanilla",
            ServerKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Listing of a world root plus the two subdirectories the classifier looks
/// into. Directory entries carry a trailing `/`, as the sync tool prints them.
#[derive(Debug, Clone, Default)]
pub struct WorldLayout {
    pub root: Vec<String>,
    pub forge_versions: Vec<String>,
    pub game_versions: Vec<String>,
}

impl WorldLayout {
    pub fn has_dir(&self, name: &str) -> bool {
        let name = name.trim_end_matches('/');
        self.root
            .iter()
            .any(|entry| entry.trim_end_matches('/') == name && entry.ends_with('/'))
    }
}

pub fn classify(layout: &WorldLayout) -> (ServerKind, Option<String>) {
    if let Some(dir) = first_dir(&layout.forge_versions) {
        let version = leading_version(dir).unwrap_or(dir);
        return (ServerKind::Forge, Some(version.to_string()));
    }

    if let Some(jar) = layout
        .root
        .iter()
        .find(|entry| entry.contains("forge") && entry.ends_with(".jar"))
    {
        return (ServerKind::Forge, forge_jar_version(jar));
    }

    if let Some(dir) = first_dir(&layout.game_versions) {
        return (ServerKind::Vanilla, Some(dir.to_string()));
    }

    if layout.root.iter().any(|entry| entry == "server.jar") {
        return (ServerKind::Vanilla, None);
    }

    (ServerKind::Unknown, None)
}

fn first_dir(entries: &[String]) -> Option<&str> {
    entries
        .iter()
        .map(|entry| entry.trim().trim_end_matches('/'))
        .find(|entry| !entry.is_empty())
}

/// `major.minor[.patch]` at the start of `text`.
fn leading_version(text: &str) -> Option<&str> {
    let mut end = 0;
    let mut dots = 0;
    let mut digits_in_part = 0;

    for (index, c) in text.char_indices() {
        if c.is_ascii_digit() {
            digits_in_part += 1;
            end = index + 1;
        } else if c == '.' && digits_in_part > 0 && dots < 2 {
            dots += 1;
            digits_in_part = 0;
        } else {
            break;
        }
    }

    // A trailing dot was consumed but no digits followed it.
    if digits_in_part == 0 && dots > 0 {
        dots -= 1;
    }

    if dots >= 1 {
        Some(&text[..end])
    } else {
        None
    }
}

fn forge_jar_version(jar: &str) -> Option<String> {
    jar.match_indices("forge")
        .filter_map(|(index, _)| {
            let rest = &jar[index + "forge".len()..];
            rest.strip_prefix(|c: char| c == '-' || c == '.')
                .and_then(leading_version)
                .map(str::to_string)
        })
        .next()
}
