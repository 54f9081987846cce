use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of random hex characters appended after the timestamp
const SUFFIX_LEN: usize = 12;

/// Durable identifier of one stored image payload.
///
/// Format: `users/{owner_id}/discoveries/{discovery_id}/{unix_millis}_{suffix}.{ext}`
///
/// The owner/discovery prefix lets cleanup reconstruct every key of a
/// discovery; the millisecond timestamp plus random suffix keeps keys unique
/// even when several uploads land in the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Generate a fresh key for an image owned by `owner_id` in `discovery_id`
    pub fn generate(owner_id: Uuid, discovery_id: Uuid, extension: &str, now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{prefix}{millis}_{suffix}.{ext}",
            prefix = Self::discovery_prefix(owner_id, discovery_id),
            millis = now.timestamp_millis(),
            suffix = &suffix[..SUFFIX_LEN],
            ext = sanitize_path_component(&extension.to_lowercase()),
        ))
    }

    /// Prefix shared by every key of one discovery, trailing slash included
    pub fn discovery_prefix(owner_id: Uuid, discovery_id: Uuid) -> String {
        format!("users/{owner_id}/discoveries/{discovery_id}/")
    }

    /// Wrap a key read back from storage or the metadata table
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn belongs_to(&self, owner_id: Uuid, discovery_id: Uuid) -> bool {
        self.0
            .strip_prefix(&Self::discovery_prefix(owner_id, discovery_id))
            .is_some_and(|file| !file.is_empty() && !file.contains('/'))
    }

    /// File extension recorded in the key
    pub fn extension(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(_, ext)| ext)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Pick the stored file extension.
///
/// The original filename wins when it carries a known image extension;
/// otherwise the content type decides, with `jpg` as the fallback.
pub fn extension_for(file_name: Option<&str>, content_type: &str) -> String {
    let from_name = file_name
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "heic" | "heif"));

    from_name.unwrap_or_else(|| {
        match normalize_content_type(content_type).as_str() {
            "image/png" => "png",
            "image/heic" => "heic",
            "image/heif" => "heif",
            _ => "jpg",
        }
        .to_string()
    })
}

/// Lowercase a content type and drop parameters such as `; charset=...`
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}
