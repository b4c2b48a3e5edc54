//! Host clipboard sync into the bootstrap clipboard directory.
//!
//! On Ctrl+V the attach client calls [`sync_clipboard_to_dir`], which
//! refreshes three files the guest paste shims serve from:
//! `clipboard-image` (PNG, only when the pasteboard holds an image),
//! `clipboard-text`, and `clipboard-meta`
//! (`"<content-type>\n<unix-ns>\n"`). The stale image is removed before
//! each sync so the guest can never serve outdated image data.

use std::path::Path;

use crate::bootstrap::{filenames, write_atomic_at};
use crate::errors::FaizeResult;

/// Refresh the clipboard files from the host pasteboard.
pub async fn sync_clipboard_to_dir(dir: &Path) -> FaizeResult<()> {
    std::fs::create_dir_all(dir)?;

    // Never leave an old image behind for the guest to serve.
    match std::fs::remove_file(dir.join(filenames::CLIPBOARD_IMAGE)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let has_image = read_pasteboard_image(dir).await;
    let has_text = read_pasteboard_text(dir).await;

    write_meta(dir, content_type(has_image, has_text))
}

/// Content type recorded in `clipboard-meta`. Image wins over text.
fn content_type(has_image: bool, has_text: bool) -> &'static str {
    if has_image {
        "image/png"
    } else if has_text {
        "text/plain"
    } else {
        "none"
    }
}

fn write_meta(dir: &Path, content_type: &str) -> FaizeResult<()> {
    let now_ns = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    let meta = format!("{content_type}\n{now_ns}\n");
    write_atomic_at(&dir.join(filenames::CLIPBOARD_META), meta.as_bytes(), 0o644)
}

/// Read pasteboard image data and write `clipboard-image` as PNG.
///
/// `NSImage` loads whatever format the pasteboard holds (PNG, TIFF,
/// JPEG, ...); the TIFF representation is converted to PNG with `sips`.
/// The script goes through stdin; `osascript -e` chokes on multi-line
/// scripts passed as arguments.
#[cfg(target_os = "macos")]
async fn read_pasteboard_image(dir: &Path) -> bool {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    const TEMP_TIFF: &str = "/tmp/faize_clipboard.tiff";
    const SCRIPT: &str = r#"use framework "AppKit"
set pb to current application's NSPasteboard's generalPasteboard()
set img to current application's NSImage's alloc()'s initWithPasteboard:pb
if img is missing value then
	error "no image"
end if
set tiffData to img's TIFFRepresentation
tiffData's writeToFile:"/tmp/faize_clipboard.tiff" atomically:true
return "/tmp/faize_clipboard.tiff"
"#;

    let img_path = dir.join(filenames::CLIPBOARD_IMAGE);

    let child = tokio::process::Command::new("osascript")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(_) => return false,
    };
    if let Some(mut stdin) = child.stdin.take() {
        if stdin.write_all(SCRIPT.as_bytes()).await.is_err() {
            return false;
        }
    }
    match child.wait().await {
        Ok(status) if status.success() => {}
        _ => return false,
    }

    let converted = tokio::process::Command::new("sips")
        .args(["-s", "format", "png", TEMP_TIFF, "--out"])
        .arg(&img_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    let _ = std::fs::remove_file(TEMP_TIFF);

    if !matches!(converted, Ok(status) if status.success()) {
        return false;
    }
    matches!(std::fs::metadata(&img_path), Ok(meta) if meta.len() > 0)
}

#[cfg(not(target_os = "macos"))]
async fn read_pasteboard_image(_dir: &Path) -> bool {
    false
}

/// Read pasteboard text and write `clipboard-text`.
#[cfg(target_os = "macos")]
async fn read_pasteboard_text(dir: &Path) -> bool {
    let output = match tokio::process::Command::new("pbpaste").output().await {
        Ok(output) => output,
        Err(_) => return false,
    };
    if !output.status.success() || output.stdout.is_empty() {
        return false;
    }
    write_atomic_at(&dir.join(filenames::CLIPBOARD_TEXT), &output.stdout, 0o644).is_ok()
}

#[cfg(not(target_os = "macos"))]
async fn read_pasteboard_text(_dir: &Path) -> bool {
    false
}
