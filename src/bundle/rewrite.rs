//! Rewriting media references in archived markup to bundle-local files.
//!
//! Player slots are `<video src>`, `<source src>` (video) and `<video poster>`
//! (image). Each slot is paired with a manifest asset:
//!
//! 1. by filename, when the reference URL's last path segment names an asset;
//! 2. otherwise positionally, taking the next unused available asset of the
//!    same kind in the order given;
//! 3. otherwise it is pointed at [`PLACEHOLDER`].
//!
//! An `<img src>` is only touched when it names a manifest asset. Anything
//! else on the page (logos, UI art) is left as archived.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::types::MediaKind;

/// Target for references that have no asset. Never a file, so a bundle can
/// never reference a missing local file.
pub const PLACEHOLDER: &str = "about:blank";

/// Subdirectory of a bundle holding its media files.
pub const MEDIA_DIR: &str = "media";

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<(video|source|img)\b[^>]*>").expect("valid tag regex")
    })
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(\s)(src|poster)(\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
            .expect("valid attribute regex")
    })
}

/// A manifest asset as seen by the rewriter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAsset {
    pub filename: String,
    pub kind: MediaKind,
    /// Verified on disk and safe to reference.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub html: String,
    /// Asset filenames the new markup references, without duplicates.
    pub used: Vec<String>,
    pub rewritten: usize,
    pub placeholders: usize,
}

/// Where a reference sits in the markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// `<video src>` or `<source src>`.
    Video,
    /// `<video poster>`.
    Poster,
    /// `<img src>`; only rewritten on a filename match.
    Img,
}

impl Slot {
    fn of(tag: &str, attr: &str) -> Option<Self> {
        match (tag.to_ascii_lowercase().as_str(), attr.to_ascii_lowercase().as_str()) {
            ("video", "src") | ("source", "src") => Some(Self::Video),
            ("video", "poster") => Some(Self::Poster),
            ("img", "src") => Some(Self::Img),
            _ => None,
        }
    }

    fn kind(self) -> MediaKind {
        match self {
            Self::Video => MediaKind::Video,
            Self::Poster | Self::Img => MediaKind::Image,
        }
    }
}

/// One reference found in the markup, in document order.
#[derive(Debug)]
struct Reference {
    slot: Slot,
    name: String,
}

/// What a reference becomes.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Asset(&'a str),
    Placeholder,
    Keep,
}

/// Last path segment of a reference URL, percent-decoded, with query and
/// fragment removed.
pub fn reference_basename(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    let segment = path.rsplit('/').next().unwrap_or(path);
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// Relative URL of an asset inside the bundle.
pub fn bundle_href(filename: &str) -> String {
    format!("{MEDIA_DIR}/{}", urlencoding::encode(filename))
}

fn is_rewritable(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && !v.starts_with("data:") && !v.starts_with('#')
}

/// Visit every rewritable reference in document order.
fn for_each_reference<F>(html: &str, mut visit: F) -> String
where
    F: FnMut(Slot, &str) -> Option<String>,
{
    tag_regex()
        .replace_all(html, |tag: &Captures| {
            let tag_name = tag[1].to_string();
            attr_regex()
                .replace_all(&tag[0], |attr: &Captures| {
                    let value = attr
                        .get(4)
                        .or_else(|| attr.get(5))
                        .map(|m| m.as_str())
                        .unwrap_or("");
                    let slot = match Slot::of(&tag_name, &attr[2]) {
                        Some(slot) if is_rewritable(value) => slot,
                        _ => return attr[0].to_string(),
                    };
                    match visit(slot, value) {
                        Some(new_value) => {
                            format!("{}{}{}\"{}\"", &attr[1], &attr[2], &attr[3], new_value)
                        }
                        None => attr[0].to_string(),
                    }
                })
                .into_owned()
        })
        .into_owned()
}

/// Bundle-local files (`media/...`) referenced by `html`, decoded, in
/// document order.
pub fn media_references(html: &str) -> Vec<String> {
    let prefix = format!("{MEDIA_DIR}/");
    let mut found = Vec::new();
    for_each_reference(html, |_, value| {
        if let Some(rest) = value.trim().strip_prefix(&prefix) {
            found.push(reference_basename(rest));
        }
        None
    });
    found
}

/// Rewrite every media reference in `html` against the manifest `assets`.
pub fn rewrite_media_refs(html: &str, assets: &[LocalAsset]) -> Rewrite {
    let mut references = Vec::new();
    for_each_reference(html, |slot, value| {
        references.push(Reference {
            slot,
            name: reference_basename(value),
        });
        None
    });

    let by_name: HashMap<&str, &LocalAsset> =
        assets.iter().map(|a| (a.filename.as_str(), a)).collect();

    // Name matches claim their assets before any positional pairing.
    let mut assignment: Vec<Option<Target>> = references
        .iter()
        .map(|r| {
            by_name.get(r.name.as_str()).map(|a| {
                if a.available {
                    Target::Asset(a.filename.as_str())
                } else {
                    Target::Placeholder
                }
            })
        })
        .collect();
    let claimed: HashSet<&str> = references
        .iter()
        .filter_map(|r| by_name.get(r.name.as_str()).map(|a| a.filename.as_str()))
        .collect();

    let mut queues: HashMap<MediaKind, std::vec::IntoIter<&LocalAsset>> = HashMap::new();
    for kind in [MediaKind::Image, MediaKind::Video] {
        let remaining: Vec<&LocalAsset> = assets
            .iter()
            .filter(|a| {
                a.kind == kind && a.available && !claimed.contains(a.filename.as_str())
            })
            .collect();
        queues.insert(kind, remaining.into_iter());
    }
    for (slot, reference) in assignment.iter_mut().zip(&references) {
        if slot.is_some() {
            continue;
        }
        *slot = Some(if reference.slot == Slot::Img {
            Target::Keep
        } else {
            queues
                .get_mut(&reference.slot.kind())
                .and_then(Iterator::next)
                .map_or(Target::Placeholder, |a| Target::Asset(a.filename.as_str()))
        });
    }

    let mut used: Vec<String> = Vec::new();
    let mut rewritten = 0;
    let mut placeholders = 0;
    let mut index = 0;
    let html = for_each_reference(html, |_, _| {
        let target = assignment.get(index).copied().flatten();
        index += 1;
        match target {
            Some(Target::Asset(filename)) => {
                rewritten += 1;
                if !used.iter().any(|u| u == filename) {
                    used.push(filename.to_string());
                }
                Some(bundle_href(filename))
            }
            Some(Target::Placeholder) => {
                placeholders += 1;
                Some(PLACEHOLDER.to_string())
            }
            Some(Target::Keep) | None => None,
        }
    });

    Rewrite {
        html,
        used,
        rewritten,
        placeholders,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> LocalAsset {
        LocalAsset {
            filename: name.into(),
            kind: MediaKind::Image,
            available: true,
        }
    }

    fn video(name: &str) -> LocalAsset {
        LocalAsset {
            filename: name.into(),
            kind: MediaKind::Video,
            available: true,
        }
    }

    fn missing(mut asset: LocalAsset) -> LocalAsset {
        asset.available = false;
        asset
    }

    #[test]
    fn basename_strips_query_fragment_and_decodes() {
        assert_eq!(
            reference_basename("https://h/files/images/My%20Ad.jpg?v=3#x"),
            "My Ad.jpg"
        );
        assert_eq!(reference_basename("clip.mp4"), "clip.mp4");
    }

    #[test]
    fn href_is_relative_and_encoded() {
        assert_eq!(bundle_href("My Ad.jpg"), "media/My%20Ad.jpg");
    }

    #[test]
    fn matches_by_filename_regardless_of_order() {
        let html = r#"<img src="https://h/b.jpg"><img class="x" src='https://h/a.jpg'>"#;
        let r = rewrite_media_refs(html, &[image("a.jpg"), image("b.jpg")]);
        assert_eq!(
            r.html,
            r#"<img src="media/b.jpg"><img class="x" src="media/a.jpg">"#
        );
        assert_eq!(r.used, vec!["b.jpg", "a.jpg"]);
        assert_eq!(r.rewritten, 2);
        assert_eq!(r.placeholders, 0);
    }

    #[test]
    fn unmatched_references_fall_back_to_position_by_kind() {
        let html = concat!(
            r#"<video autoplay src="blob-1" poster="p1"></video>"#,
            r#"<video><source src="blob-2" type="video/mp4"></video>"#
        );
        let assets = [image("poster.jpg"), video("one.mp4"), video("two.mp4")];
        let r = rewrite_media_refs(html, &assets);
        assert_eq!(
            r.html,
            concat!(
                r#"<video autoplay src="media/one.mp4" poster="media/poster.jpg"></video>"#,
                r#"<video><source src="media/two.mp4" type="video/mp4"></video>"#
            )
        );
        assert_eq!(r.rewritten, 3);
    }

    #[test]
    fn name_matches_are_not_consumed_positionally() {
        // The poster has no name match; it must not take b.jpg, which the
        // image names explicitly.
        let html = r#"<video poster="x"></video><img src="/b.jpg">"#;
        let r = rewrite_media_refs(html, &[image("b.jpg"), image("c.jpg")]);
        assert_eq!(
            r.html,
            r#"<video poster="media/c.jpg"></video><img src="media/b.jpg">"#
        );
    }

    #[test]
    fn images_outside_the_manifest_are_left_alone() {
        let html = r#"<img src="assets/logo.png"><img src="https://h/a.jpg"><img src="https://h/b.jpg">"#;
        let r = rewrite_media_refs(html, &[image("a.jpg"), image("b.jpg")]);
        assert_eq!(
            r.html,
            r#"<img src="assets/logo.png"><img src="media/a.jpg"><img src="media/b.jpg">"#
        );
        assert_eq!(r.rewritten, 2);
        assert_eq!(r.placeholders, 0);
    }

    #[test]
    fn unmatched_image_never_takes_a_spare_asset() {
        let html = r#"<img src="banner.png"><video poster="p"></video>"#;
        let r = rewrite_media_refs(html, &[image("ad.jpg")]);
        assert_eq!(
            r.html,
            r#"<img src="banner.png"><video poster="media/ad.jpg"></video>"#
        );
        assert_eq!(r.used, vec!["ad.jpg"]);
    }

    #[test]
    fn unavailable_manifest_asset_becomes_placeholder() {
        let html = r#"<img src="https://h/gone.jpg"><video src="https://h/gone.mp4"></video>"#;
        let assets = [missing(image("gone.jpg")), missing(video("gone.mp4")), video("ok.mp4")];
        let r = rewrite_media_refs(html, &assets);
        assert_eq!(
            r.html,
            r#"<img src="about:blank"><video src="about:blank"></video>"#
        );
        assert_eq!(r.placeholders, 2);
        assert!(r.used.is_empty());
    }

    #[test]
    fn shortage_of_assets_uses_placeholder() {
        let html = r#"<video src="a"></video><video src="b"></video>"#;
        let r = rewrite_media_refs(html, &[video("only.mp4")]);
        assert_eq!(
            r.html,
            r#"<video src="media/only.mp4"></video><video src="about:blank"></video>"#
        );
        assert_eq!(r.placeholders, 1);
        assert_eq!(r.used, vec!["only.mp4"]);
    }

    #[test]
    fn data_uris_and_unrelated_tags_are_untouched() {
        let html = r#"<img src="data:image/png;base64,AAA"><script src="app.js"></script><a href="x.jpg">"#;
        let r = rewrite_media_refs(html, &[image("x.jpg")]);
        assert_eq!(r.html, html);
        assert_eq!(r.rewritten, 0);
        assert!(r.used.is_empty());
    }

    #[test]
    fn media_references_lists_local_targets() {
        let html = r#"<img src="media/My%20Ad.jpg"><video src="about:blank" poster="media/p.png">"#;
        assert_eq!(media_references(html), vec!["My Ad.jpg", "p.png"]);
    }

    #[test]
    fn uppercase_tags_are_recognised() {
        let html = r#"<IMG SRC="https://h/a.jpg">"#;
        let r = rewrite_media_refs(html, &[image("a.jpg")]);
        assert_eq!(r.html, r#"<IMG SRC="media/a.jpg">"#);
    }
}
