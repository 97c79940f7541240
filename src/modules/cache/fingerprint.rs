use sha2::{Digest, Sha256};

/// エンドポイントとクエリパラメータからキャッシュキーを導出する。
///
/// 返り値は `namespace:digest` 形式。namespace はエンドポイント先頭
/// セグメントで、キー種別ごとの集計や前方一致の無効化に使う。
/// digest はパラメータ順序に依存しない決定的なハッシュ。
pub fn fingerprint(endpoint: &str, params: &[(String, String)]) -> String {
    let trimmed = endpoint.trim_matches('/');
    let namespace = trimmed
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("root");

    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(trimmed.as_bytes());
    for (key, value) in sorted {
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{namespace}:{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let params = pairs(&[("page", "1"), ("limit", "20")]);
        assert_eq!(
            fingerprint("drafts", &params),
            fingerprint("drafts", &params)
        );
    }

    #[test]
    fn test_fingerprint_ignores_param_order() {
        let a = pairs(&[("page", "1"), ("limit", "20")]);
        let b = pairs(&[("limit", "20"), ("page", "1")]);
        assert_eq!(fingerprint("drafts", &a), fingerprint("drafts", &b));
    }

    #[test]
    fn test_fingerprint_differs_per_endpoint_and_params() {
        let params = pairs(&[("page", "1")]);
        assert_ne!(
            fingerprint("drafts", &params),
            fingerprint("images", &params)
        );
        assert_ne!(
            fingerprint("drafts", &params),
            fingerprint("drafts", &pairs(&[("page", "2")]))
        );
    }

    #[test]
    fn test_fingerprint_namespace_prefix() {
        let key = fingerprint("/drafts/recent", &[]);
        assert!(key.starts_with("drafts:"));
    }
}
