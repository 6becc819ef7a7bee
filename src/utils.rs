use std::{env, path::Path};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

async fn download_file(url: &str, path: &Path) -> Result<()> {
    info!("Downloading {} from {}", path.display(), url);
    let download_err = |reason: String| Error::Download {
        url: url.to_string(),
        reason,
    };

    let mut header_map = HeaderMap::new();
    if let Ok(token) = env::var("GITHUB_TOKEN") {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| download_err("GITHUB_TOKEN is not a valid header value".into()))?;
        header_map.insert(AUTHORIZATION, auth_value);
    }
    header_map.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .headers(header_map)
        .send()
        .await
        .map_err(|e| download_err(e.to_string()))?;

    if !response.status().is_success() {
        return Err(download_err(format!("server responded {}", response.status())));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| download_err(e.to_string()))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| Error::io(path, e))
}

/// Makes sure the pretrained backbone is on disk, fetching it when a URL is configured.
pub async fn ensure_backbone(path: &Path, url: Option<&str>) -> Result<()> {
    info!("Checking backbone...");
    if path.exists() {
        return Ok(());
    }
    match url {
        Some(url) => download_file(url, path).await,
        None => Err(Error::Config(format!(
            "backbone {} is missing and BACKBONE_URL is not set",
            path.display()
        ))),
    }
}

/// Whether the client filename carries one of the accepted image extensions.
pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduces a client filename to a single safe path component.
///
/// Runs of dots collapse to one, so the result always passes
/// [`is_safe_upload_name`] when it is not empty.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut cleaned = String::with_capacity(base.len());
    for c in base.chars() {
        if c == '.' && cleaned.ends_with('.') {
            continue;
        }
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
            cleaned.push(c);
        } else {
            cleaned.push('_');
        }
    }
    cleaned.trim_start_matches('.').to_string()
}

/// `<unix seconds>_<8 hex chars>_<sanitized filename>`.
pub fn unique_filename(filename: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        chrono::Utc::now().timestamp(),
        &id[..8],
        sanitize_filename(filename)
    )
}

/// Whether a requested upload name stays inside the upload directory.
///
/// A single component with no leading dot can be neither `.` nor `..`.
pub fn is_safe_upload_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_image_extensions() {
        assert!(allowed_file("rose.jpg"));
        assert!(allowed_file("rose.JPEG"));
        assert!(allowed_file("archive.tar.png"));
        assert!(!allowed_file("rose.gif"));
        assert!(!allowed_file("png"));
        assert!(!allowed_file("rose."));
    }

    #[test]
    fn sanitizing_drops_directories_and_odd_characters() {
        assert_eq!(sanitize_filename("rose.jpg"), "rose.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd.png"), "passwd.png");
        assert_eq!(sanitize_filename("C:\\photos\\my rose.png"), "my_rose.png");
        assert_eq!(sanitize_filename("..hidden.png"), "hidden.png");
        assert_eq!(sanitize_filename("fleur-été.jpg"), "fleur-_t_.jpg");
    }

    #[test]
    fn sanitizing_collapses_repeated_dots() {
        assert_eq!(sanitize_filename("my..rose.png"), "my.rose.png");
        assert_eq!(sanitize_filename("a...b....png"), "a.b.png");
        assert_eq!(sanitize_filename("dir/..."), "");
        assert!(is_safe_upload_name(&unique_filename("my..rose.png")));
    }

    #[test]
    fn unique_names_embed_time_id_and_name() {
        let name = unique_filename("rose.png");
        let mut parts = name.splitn(3, '_');
        let secs = parts.next().unwrap();
        let id = parts.next().unwrap();
        assert!(secs.parse::<i64>().unwrap() > 0);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts.next(), Some("rose.png"));
    }

    #[test]
    fn unique_names_differ_for_the_same_upload() {
        assert_ne!(unique_filename("rose.png"), unique_filename("rose.png"));
    }

    #[test]
    fn upload_names_must_stay_in_the_directory() {
        assert!(is_safe_upload_name("1700000000_deadbeef_rose.png"));
        assert!(!is_safe_upload_name(""));
        assert!(!is_safe_upload_name(".env"));
        assert!(!is_safe_upload_name("../secret.png"));
        assert!(!is_safe_upload_name("a/b.png"));
        assert!(!is_safe_upload_name("a\\b.png"));
        assert!(!is_safe_upload_name(".."));
        assert!(is_safe_upload_name("1700000000_deadbeef_my..rose.png"));
    }

    #[tokio::test]
    async fn existing_backbone_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone.pb");
        std::fs::write(&path, b"graph").unwrap();
        ensure_backbone(&path, None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_backbone_without_url_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_backbone(&dir.path().join("backbone.pb"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
