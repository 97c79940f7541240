use crate::shared::config::UploadConfig;
use crate::shared::error::{EngineError, Result};

/// 転送前の同期バリデーション。ネットワークには一切触れず、
/// 違反は即座に `Validation` エラーとして返す（再試行対象にしない）。
pub fn validate_file(
    config: &UploadConfig,
    file_name: &str,
    file_size: u64,
    mime_type: &str,
) -> Result<()> {
    if file_name.trim().is_empty() {
        return Err(EngineError::Validation("file name is empty".into()));
    }
    if file_size == 0 {
        return Err(EngineError::Validation(format!(
            "file {file_name} is empty"
        )));
    }

    let allowed = config
        .allowed_mime_prefixes
        .iter()
        .any(|prefix| mime_type.starts_with(prefix.as_str()));
    if !allowed {
        return Err(EngineError::Validation(format!(
            "unsupported file type: {mime_type}"
        )));
    }

    let ceiling = size_ceiling(config, mime_type);
    if file_size > ceiling {
        return Err(EngineError::Validation(format!(
            "file {file_name} is too large: {file_size} bytes (limit {ceiling})"
        )));
    }

    Ok(())
}

/// MIME の大分類ごとのサイズ上限。
fn size_ceiling(config: &UploadConfig, mime_type: &str) -> u64 {
    if mime_type.starts_with("image/") {
        config.max_image_bytes
    } else if mime_type.starts_with("video/") {
        config.max_video_bytes
    } else {
        config.max_file_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::EngineConfig;

    fn config() -> UploadConfig {
        EngineConfig::default().upload
    }

    #[test]
    fn test_accepts_ordinary_image() {
        assert!(validate_file(&config(), "photo.png", 1024, "image/png").is_ok());
    }

    #[test]
    fn test_rejects_unsupported_mime() {
        let result = validate_file(&config(), "tool.exe", 1024, "application/x-msdownload");
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_rejects_oversized_image_but_allows_same_size_video() {
        let cfg = config();
        let size = cfg.max_image_bytes + 1;
        assert!(matches!(
            validate_file(&cfg, "big.png", size, "image/png"),
            Err(EngineError::Validation(_))
        ));
        // 動画の上限は別枠
        assert!(validate_file(&cfg, "big.mp4", size, "video/mp4").is_ok());
    }

    #[test]
    fn test_rejects_empty_file_and_name() {
        assert!(matches!(
            validate_file(&config(), "a.png", 0, "image/png"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_file(&config(), "  ", 10, "image/png"),
            Err(EngineError::Validation(_))
        ));
    }
}
