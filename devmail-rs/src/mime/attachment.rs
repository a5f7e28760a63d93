//! Server-side attachment file naming
//!
//! Attachments are written under a generated name so that user-supplied
//! filenames never reach the filesystem. The name is derived from the part
//! itself (its Content-ID, or its position, filename and bytes), so parsing
//! the same `.eml` again yields the same name and restored messages still
//! resolve their files.

use crate::model::Attachment;
use sha2::{Digest, Sha256};
use std::path::Path;

const FALLBACK_EXTENSION: &str = ".bin";

/// Compute the generated filename once; later calls are no-ops
///
/// `index` is the attachment's position within the message.
pub fn transform_attachment(attachment: &mut Attachment, index: usize, body: &[u8]) {
    if attachment.transformed {
        return;
    }

    let ext = extension_for(&attachment.file_name, &attachment.content_type);

    let mut hasher = Sha256::new();
    if attachment.content_id.is_empty() {
        hasher.update(index.to_be_bytes());
        hasher.update(attachment.file_name.as_bytes());
        hasher.update(body);
    } else {
        hasher.update(attachment.content_id.as_bytes());
    }
    let digest = hasher.finalize();
    let name: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();

    attachment.generated_file_name = format!("{}{}", name, ext);
    attachment.transformed = true;
}

/// Extension from the filename, else from the content type, else `.bin`
pub fn extension_for(file_name: &str, content_type: &str) -> String {
    let from_name = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()));
    if let Some(ext) = from_name {
        return format!(".{}", ext.to_ascii_lowercase());
    }

    let media = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    mime_guess::get_mime_extensions_str(&media)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(file_name: &str, content_type: &str, content_id: &str) -> Attachment {
        Attachment {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            content_id: content_id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_extension_from_filename() {
        assert_eq!(extension_for("report.PDF", "application/octet-stream"), ".pdf");
    }

    #[test]
    fn test_extension_from_content_type() {
        assert_eq!(extension_for("image/png", "image/png"), ".png");
        assert_eq!(extension_for("", "application/pdf; name=x"), ".pdf");
        assert_eq!(extension_for("", "application/rtf"), ".rtf");
        assert_eq!(extension_for("", "Application/X-Tar"), ".tar");

        let jpeg = extension_for("", "image/jpeg");
        assert!([".jpg", ".jpeg", ".jpe", ".jfif"].contains(&jpeg.as_str()), "{}", jpeg);
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(extension_for("blob", "application/x-unknown"), ".bin");
    }

    #[test]
    fn test_content_id_name_is_stable() {
        let mut a = attachment("logo.png", "image/png", "logo@example");
        let mut b = attachment("other.png", "image/png", "logo@example");
        transform_attachment(&mut a, 0, b"one");
        transform_attachment(&mut b, 3, b"two");
        assert_eq!(a.generated_file_name, b.generated_file_name);
        assert!(a.generated_file_name.ends_with(".png"));
        assert!(a.transformed);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let mut a = attachment("notes.txt", "text/plain", "");
        transform_attachment(&mut a, 0, b"notes");
        let first = a.generated_file_name.clone();
        transform_attachment(&mut a, 1, b"changed");
        assert_eq!(a.generated_file_name, first);
    }

    #[test]
    fn test_name_is_reproducible_from_content() {
        let mut a = attachment("notes.txt", "text/plain", "");
        let mut b = attachment("notes.txt", "text/plain", "");
        transform_attachment(&mut a, 1, b"same bytes");
        transform_attachment(&mut b, 1, b"same bytes");
        assert_eq!(a.generated_file_name, b.generated_file_name);
        assert!(a.generated_file_name.ends_with(".txt"));
    }

    #[test]
    fn test_names_differ_by_position_and_content() {
        let mut first = attachment("notes.txt", "text/plain", "");
        let mut second = attachment("notes.txt", "text/plain", "");
        let mut other = attachment("notes.txt", "text/plain", "");
        transform_attachment(&mut first, 0, b"same bytes");
        transform_attachment(&mut second, 1, b"same bytes");
        transform_attachment(&mut other, 0, b"other bytes");
        assert_ne!(first.generated_file_name, second.generated_file_name);
        assert_ne!(first.generated_file_name, other.generated_file_name);
    }
}
