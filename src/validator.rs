use std::path::Path;

/// Audio extensions the worker can decode.
pub const SUPPORTED_AUDIO_FORMATS: [&str; 8] =
    ["opus", "mp3", "wav", "m4a", "ogg", "flac", "aac", "wma"];

/// `true` when `path` names an existing regular file.
///
/// Failures here are deterministic: a missing file will still be missing on
/// retry, so the dispatcher publishes a terminal error without consuming a
/// worker slot.
pub fn file_exists(path: &str) -> bool {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return false,
    };
    meta.is_file()
}

/// Case-insensitive check of the file extension against
/// [`SUPPORTED_AUDIO_FORMATS`].
pub fn has_supported_extension(path: &str) -> bool {
    let ext = match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some(e) => e.to_ascii_lowercase(),
        None => return false,
    };
    SUPPORTED_AUDIO_FORMATS.contains(&ext.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn every_supported_extension_passes() {
        for ext in SUPPORTED_AUDIO_FORMATS {
            let path = format!("/audio/sample.{ext}");
            assert!(has_supported_extension(&path), "rejected .{ext}");
        }
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert!(has_supported_extension("/audio/VOICEMAIL.MP3"));
        assert!(has_supported_extension("/audio/clip.Opus"));
    }

    #[test]
    fn unknown_or_missing_extensions_are_rejected() {
        assert!(!has_supported_extension("/audio/clip.xyz"));
        assert!(!has_supported_extension("/audio/noext"));
        assert!(!has_supported_extension(""));
    }

    #[test]
    fn file_exists_rejects_missing_paths_and_directories() {
        assert!(!file_exists("/nonexistent/missing.mp3"));
        assert!(!file_exists(""));
        assert!(!file_exists("/tmp"));
    }

    #[test]
    fn file_exists_accepts_regular_files() {
        let path = std::env::temp_dir().join("whispool_validator_probe.mp3");
        fs::write(&path, b"ID3").unwrap();
        assert!(file_exists(path.to_str().unwrap()));
        let _ = fs::remove_file(&path);
    }
}
