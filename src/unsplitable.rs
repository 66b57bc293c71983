//! Detection of release directories that must be matched as a whole.
//!
//! Multi-part archive sets, DVD and Blu-ray trees only make sense in their
//! original combination, so their files are keyed under the release root
//! instead of by bare name.

use once_cell::sync::Lazy;
use regex::Regex;

/// Extension pairs that mark a directory as one inseparable release.
const UNSPLITABLE_FILE_EXTENSIONS: [[&str; 2]; 3] =
    [[".rar", ".sfv"], [".mp3", ".sfv"], [".vob", ".ifo"]];

/// Packaging components that sit between a release root and its files.
static SCENE_COMPONENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(cd[1-9]|samples?|proofs?|(vob)?sub(title)?s?)$").unwrap()
});
static DISC_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(bdmv|disc\d*|video_ts)$").unwrap());

fn extension(name: &str) -> String {
    match name.rfind('.') {
        Some(dot) => name[dot..].to_lowercase(),
        None => String::new(),
    }
}

/// Checks if a directory's files can be considered unsplitable, e.g. VOB/IFO
/// or a scene release.
pub fn is_unsplitable<'a>(names: impl IntoIterator<Item = &'a str>) -> bool {
    let mut extensions = std::collections::HashSet::new();
    let mut found_magic_file = false;
    for name in names {
        extensions.insert(extension(name));
        if name.eq_ignore_ascii_case("movieobject.bdmv") {
            found_magic_file = true;
        }
    }

    let found_unsplitable_extensions = UNSPLITABLE_FILE_EXTENSIONS
        .iter()
        .any(|pair| pair.iter().all(|ext| extensions.contains(*ext)));

    found_unsplitable_extensions || found_magic_file
}

/// Scans a directory path for the actual release name, skipping packaging
/// components like `CD1` or `Subs`.
///
/// Walks from the leaf upward; the first component that is not a packaging
/// name is the release root. Returns `None` if every component is one.
pub fn root_of_unsplitable<'a, C>(components: C) -> Option<&'a str>
where
    C: IntoIterator<Item = &'a str>,
    C::IntoIter: DoubleEndedIterator,
{
    components.into_iter().rev().find(|component| {
        !component.is_empty()
            && !SCENE_COMPONENT.is_match(component)
            && !DISC_COMPONENT.is_match(component)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_protected_extension_pairs() {
        assert!(is_unsplitable(["a.rar", "a.sfv", "a.nfo"]));
        assert!(is_unsplitable(["01-track.mp3", "rls.sfv"]));
        assert!(is_unsplitable(["VTS_01_0.VOB", "VTS_01_0.IFO"]));

        assert!(!is_unsplitable(["a.rar", "a.nfo"]));
        assert!(!is_unsplitable(["a.sfv"]));
        assert!(!is_unsplitable(["a.mkv", "a.nfo"]));
        assert!(!is_unsplitable([]));
    }

    #[test]
    fn detects_bluray_marker_file() {
        assert!(is_unsplitable(["MovieObject.bdmv", "index.bdmv"]));
        assert!(is_unsplitable(["movieobject.bdmv"]));
        assert!(!is_unsplitable(["index.bdmv"]));
    }

    #[test]
    fn finds_release_root_past_packaging_components() {
        assert_eq!(
            root_of_unsplitable(["Some-CD-Release", "CD1"]),
            Some("Some-CD-Release")
        );
        assert_eq!(
            root_of_unsplitable(["Some-Release", "Subs"]),
            Some("Some-Release")
        );
        assert_eq!(
            root_of_unsplitable(["Some-Release", "Sample"]),
            Some("Some-Release")
        );
        assert_eq!(
            root_of_unsplitable(["My-Bluray", "BDMV", "STREAM"]),
            Some("My-Bluray")
        );
        assert_eq!(
            root_of_unsplitable(["My-DVD", "VIDEO_TS"]),
            Some("My-DVD")
        );
        assert_eq!(
            root_of_unsplitable(["Stacked", "Disc2", "VIDEO_TS"]),
            Some("Stacked")
        );
        assert_eq!(root_of_unsplitable(["Plain-Release"]), Some("Plain-Release"));
    }

    #[test]
    fn packaging_only_paths_have_no_root() {
        assert_eq!(root_of_unsplitable(["CD1"]), None);
        assert_eq!(root_of_unsplitable(["cd2", "Subs"]), None);
        assert_eq!(root_of_unsplitable([]), None);
    }

    #[test]
    fn release_root_matching_is_case_insensitive() {
        assert_eq!(root_of_unsplitable(["Rls", "VOBSUBS"]), Some("Rls"));
        assert_eq!(root_of_unsplitable(["Rls", "subtitles"]), Some("Rls"));
        assert_eq!(root_of_unsplitable(["Rls", "PROOF"]), Some("Rls"));
        assert_eq!(root_of_unsplitable(["Rls", "bdmv"]), Some("Rls"));
    }
}
