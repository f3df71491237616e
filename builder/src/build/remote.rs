//! Remote ADD sources.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use kiln_core::error::{BuildError, Result};

use super::fileops::CopyOptions;

/// Default mode for downloaded files when no `--chmod` is given.
pub const DEFAULT_DOWNLOAD_MODE: u32 = 0o600;

pub fn is_remote_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Image path a URL is downloaded to: `dest` itself, or the last URL path
/// segment beneath `dest` when the destination names a directory.
pub fn url_destination(url: &str, dest: &str, dest_is_dir: bool) -> Result<String> {
    if !dest_is_dir {
        return Ok(dest.to_string());
    }
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let name = without_query
        .splitn(4, '/')
        .nth(3)
        .and_then(|path| path.rsplit('/').find(|s| !s.is_empty()))
        .ok_or_else(|| {
            BuildError::Resolution(format!(
                "cannot determine a file name from URL '{}'; give an explicit destination",
                url
            ))
        })?;
    Ok(format!("{}/{}", dest.trim_end_matches('/'), name))
}

/// Fetch `url` into `dest`, applying ownership, mode and the server's
/// `Last-Modified` time.
pub async fn download(url: &str, dest: &Path, options: &CopyOptions) -> Result<()> {
    tracing::info!(url, dest = %dest.display(), "Downloading remote source");

    let transport = |message: String| BuildError::Transport {
        target: url.to_string(),
        message,
    };

    let response = reqwest::get(url)
        .await
        .map_err(|e| transport(format!("request failed: {}", e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(transport(format!("unexpected status {}", status)));
    }

    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    let body = response
        .bytes()
        .await
        .map_err(|e| transport(format!("failed to read body: {}", e)))?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if dest.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::write(dest, &body).map_err(|e| {
        BuildError::effect(format!("Failed to write {}: {}", dest.display(), e))
    })?;

    if let Some(mtime) = last_modified {
        std::fs::File::open(dest)?.set_modified(mtime)?;
    }

    let mode = options.mode.unwrap_or(DEFAULT_DOWNLOAD_MODE);
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))?;
    if let Some(owner) = options.owner {
        owner.apply(dest)?;
    }

    tracing::debug!(url, bytes = body.len(), "Download complete");
    Ok(())
}

/// Parse an HTTP date (RFC 2822 style, e.g. `Wed, 21 Oct 2015 07:28:00 GMT`).
fn parse_http_date(value: &str) -> Option<SystemTime> {
    let parsed = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let secs = u64::try_from(parsed.timestamp()).ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}
