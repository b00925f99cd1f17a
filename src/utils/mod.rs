use encoding_rs::GBK;
use std::path::Path;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Strips the characters that are not allowed in file names on common filesystems.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .collect()
}

/// Decodes a downloaded text asset into a normalized UTF-8 string.
///
/// Valid UTF-8 is taken as-is (minus a leading BOM); anything else is read as GBK,
/// which is what the source site serves. Line endings are normalized to `\n`.
pub fn decode_text(bytes: &[u8]) -> String {
    // Handle potential BOM (Byte Order Mark) in UTF-8 files
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);

    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let (decoded, _, had_errors) = GBK.decode(bytes);
            if had_errors {
                tracing::debug!("text asset contained bytes outside GBK, replaced");
            }
            decoded.into_owned()
        }
    };

    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Decodes an HTML page body served by the source site.
pub fn decode_page(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => GBK.decode(bytes).0.into_owned(),
    }
}

/// Percent-encodes `value` after converting it to GBK, for query strings the site expects in GBK.
pub fn gbk_query_component(value: &str) -> String {
    let (encoded, _, _) = GBK.encode(value);
    urlencoding::encode_binary(&encoded).into_owned()
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// Splits a block of text into trimmed, non-empty paragraphs.
pub fn paragraphs(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
