//! Wire and domain types for the playlist status and manifest endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Response of `GET <base>/status/<deviceId>`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    #[serde(rename = "modifiedOn", deserialize_with = "int_or_string")]
    pub modified_on: i64,
}

/// The server has been seen to send `modifiedOn` both as a number and as a
/// numeric string.
fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Int(v) => Ok(v),
        Raw::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManifestResponse {
    pub group: GroupJson,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GroupJson {
    pub playlist: PlaylistJson,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlaylistJson {
    #[serde(default)]
    pub advertisements: Vec<AdEntry>,
}

/// One slide: up to two images, each with a declared MD5.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdEntry {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub first_image: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub second_image: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub first_image_md5: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub second_image_md5: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl AdEntry {
    /// The non-empty image references of this entry, first image first.
    pub fn assets(&self) -> Vec<AssetRef> {
        [
            (&self.first_image, &self.first_image_md5),
            (&self.second_image, &self.second_image_md5),
        ]
        .into_iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, md5)| AssetRef {
            filename: name.trim().to_string(),
            checksum: md5.trim().to_ascii_lowercase(),
        })
        .collect()
    }
}

/// A media file referenced by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AssetRef {
    pub filename: String,
    /// Lowercase hex MD5; empty when the server did not declare one.
    pub checksum: String,
}

/// A fetched manifest, stamped with the status version that led to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub modified_on: i64,
    pub ads: Vec<AdEntry>,
}

impl Manifest {
    pub(crate) fn from_response(modified_on: i64, response: ManifestResponse) -> Self {
        Self {
            modified_on,
            ads: response.group.playlist.advertisements,
        }
    }

    /// Distinct assets in manifest order. Unsafe filenames are dropped; a
    /// filename declared twice with different checksums keeps the first.
    pub fn assets(&self) -> Vec<AssetRef> {
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut out = Vec::new();
        for asset in self.ads.iter().flat_map(AdEntry::assets) {
            if !is_safe_filename(&asset.filename) {
                tracing::warn!(filename = %asset.filename, "Ignoring unsafe media filename");
                continue;
            }
            match seen.get(&asset.filename) {
                Some(existing) => {
                    if *existing != asset.checksum {
                        tracing::warn!(
                            filename = %asset.filename,
                            kept = %existing,
                            ignored = %asset.checksum,
                            "Conflicting checksums for the same file"
                        );
                    }
                }
                None => {
                    seen.insert(asset.filename.clone(), asset.checksum.clone());
                    out.push(asset);
                }
            }
        }
        out
    }
}

/// The media store is flat: a filename must not escape it or hide in it.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
