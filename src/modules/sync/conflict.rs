use serde_json::Value;

/// フィールド単位の置き換えマージ。ローカル側のフィールドが
/// リモート側を上書きする。どちらかが JSON オブジェクトでなければ
/// None を返し、呼び出し側は手動解決へフォールバックする。
pub fn merge_by_replace(local: &[u8], remote: &[u8]) -> Option<Vec<u8>> {
    let local: Value = serde_json::from_slice(local).ok()?;
    let remote: Value = serde_json::from_slice(remote).ok()?;

    match (local, remote) {
        (Value::Object(local), Value::Object(mut merged)) => {
            for (key, value) in local {
                merged.insert(key, value);
            }
            serde_json::to_vec(&Value::Object(merged)).ok()
        }
        _ => None,
    }
}

/// 手動解決向けに両バージョンを束ねた JSON 文字列を作る。
/// レコードの `error` フィールドに載せて UI 層へ渡す。
pub fn conflict_note(local: &[u8], remote: Option<&str>) -> String {
    let local: Value = serde_json::from_slice(local).unwrap_or(Value::Null);
    let remote: Value = remote
        .and_then(|r| serde_json::from_str(r).ok())
        .unwrap_or(Value::Null);

    serde_json::json!({
        "conflict": true,
        "local": local,
        "remote": remote,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_by_replace_prefers_local_fields() {
        let local = br#"{"title":"local","body":"edited"}"#;
        let remote = br#"{"title":"remote","body":"old","tags":["a"]}"#;

        let merged: Value =
            serde_json::from_slice(&merge_by_replace(local, remote).unwrap()).unwrap();

        assert_eq!(merged["title"], "local");
        assert_eq!(merged["body"], "edited");
        // ローカルに無いフィールドはリモートのまま残る
        assert_eq!(merged["tags"][0], "a");
    }

    #[test]
    fn test_merge_by_replace_rejects_non_objects() {
        assert!(merge_by_replace(br#"[1,2]"#, br#"{"a":1}"#).is_none());
        assert!(merge_by_replace(br#"{"a":1}"#, br#""scalar""#).is_none());
        assert!(merge_by_replace(b"not json", br#"{"a":1}"#).is_none());
    }

    #[test]
    fn test_conflict_note_carries_both_versions() {
        let note = conflict_note(br#"{"title":"mine"}"#, Some(r#"{"title":"theirs"}"#));
        let parsed: Value = serde_json::from_str(&note).unwrap();

        assert_eq!(parsed["conflict"], true);
        assert_eq!(parsed["local"]["title"], "mine");
        assert_eq!(parsed["remote"]["title"], "theirs");
    }

    #[test]
    fn test_conflict_note_tolerates_missing_remote() {
        let note = conflict_note(br#"{"title":"mine"}"#, None);
        let parsed: Value = serde_json::from_str(&note).unwrap();
        assert_eq!(parsed["remote"], Value::Null);
    }
}
