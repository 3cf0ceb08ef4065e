//! Credential sources: where [`CredentialProfile`]s are discovered from at
//! startup and on reload. Two sources are implemented — a directory of
//! JSON files, and a set of environment variables — matching spec §2's
//! "pluggable credential sources" requirement.

use super::model::{CredentialProfile, SourceTag};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One discovered profile plus where it came from, used by the manager to
/// apply the first-source-wins rule on id collisions.
pub struct DiscoveredProfile {
    pub profile: CredentialProfile,
    pub source_tag: SourceTag,
}

/// Scans `dir` for `*.json` files and parses each as a [`CredentialProfile`].
/// A file whose name doesn't already embed an id gets the file stem as its
/// id. Unparseable files are logged and skipped rather than aborting the
/// whole scan.
pub fn scan_directory(dir: &Path) -> Vec<DiscoveredProfile> {
    let mut discovered = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "credential directory not readable, skipping");
            return discovered;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".state.json"))
        {
            continue;
        }

        match load_profile_file(&path) {
            Ok(profile) => discovered.push(DiscoveredProfile {
                profile,
                source_tag: SourceTag::File,
            }),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load credential file"),
        }
    }

    discovered
}

fn load_profile_file(path: &PathBuf) -> Result<CredentialProfile, std::io::Error> {
    let bytes = std::fs::read(path)?;
    let mut profile: CredentialProfile = serde_json::from_slice(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if profile.id.is_empty() {
        profile.id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("credential")
            .to_string();
    }

    Ok(profile)
}

/// Parses credential profiles encoded in environment variables under
/// `prefix`. Each recognized variable is named `<prefix><ID>_REFRESH_TOKEN`
/// (required) with optional siblings `<prefix><ID>_CLIENT_ID`,
/// `<prefix><ID>_CLIENT_SECRET`, `<prefix><ID>_PROJECT_ID`. `<ID>` becomes
/// the credential id, lowercased.
pub fn scan_environment(prefix: &str) -> Vec<DiscoveredProfile> {
    let mut by_id: HashMap<String, CredentialProfile> = HashMap::new();

    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some((id, field)) = rest.rsplit_once('_').map(|(id, field)| (id, field))
        else {
            continue;
        };

        // Fields are themselves suffixes like `REFRESH_TOKEN`, so re-join
        // anything past the first split that belongs to the field name.
        let (id, field) = split_id_and_field(rest);
        let id = id.to_lowercase();

        let entry = by_id.entry(id.clone()).or_insert_with(|| CredentialProfile {
            id,
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: String::new(),
            access_token: None,
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            project_id: None,
            expires_at: None,
            scopes: Vec::new(),
        });

        match field {
            "REFRESH_TOKEN" => entry.refresh_token = value,
            "CLIENT_ID" => entry.client_id = value,
            "CLIENT_SECRET" => entry.client_secret = value,
            "PROJECT_ID" => entry.project_id = Some(value),
            "TOKEN_URI" => entry.token_uri = value,
            _ => {}
        }
    }

    by_id
        .into_values()
        .filter(|p| !p.refresh_token.is_empty())
        .map(|profile| DiscoveredProfile {
            profile,
            source_tag: SourceTag::Env,
        })
        .collect()
}

fn split_id_and_field(rest: &str) -> (&str, &str) {
    const FIELDS: &[&str] = &[
        "REFRESH_TOKEN",
        "CLIENT_ID",
        "CLIENT_SECRET",
        "PROJECT_ID",
        "TOKEN_URI",
    ];
    for field in FIELDS {
        if let Some(id) = rest.strip_suffix(field) {
            if let Some(id) = id.strip_suffix('_') {
                return (id, field);
            }
        }
    }
    (rest, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_known_field_suffixes() {
        assert_eq!(split_id_and_field("ALPHA_REFRESH_TOKEN"), ("ALPHA", "REFRESH_TOKEN"));
        assert_eq!(split_id_and_field("ALPHA_ONE_CLIENT_SECRET"), ("ALPHA_ONE", "CLIENT_SECRET"));
    }

    #[test]
    fn scan_directory_missing_dir_returns_empty() {
        let discovered = scan_directory(Path::new("/nonexistent/path/for/test"));
        assert!(discovered.is_empty());
    }
}
