// Session-recording parameters for catalog entries.

use chrono::Local;
use serde_json::{json, Map, Value};

use crate::config::RecordingSettings;

pub const RECORDING_KEYS: [&str; 4] = [
    "recording-path",
    "recording-name",
    "recording-include-keys",
    "create-recording-path",
];

/// Expand the `${GUAC_USERNAME}` / `${GUAC_DATE}` / `${GUAC_TIME}` variables
/// in a recording-name pattern.
pub fn substitute_recording_name(pattern: &str, username: &str) -> String {
    let now = Local::now();
    let username = if username.is_empty() {
        "unknown"
    } else {
        username
    };
    pattern
        .replace("${GUAC_USERNAME}", username)
        .replace("${GUAC_DATE}", &now.format("%Y%m%d").to_string())
        .replace("${GUAC_TIME}", &now.format("%H%M%S").to_string())
}

/// Bring the recording parameters of a connection in line with config:
/// inserted when recording is enabled, removed entirely when it is not.
pub fn apply_recording(params: &mut Map<String, Value>, cfg: &RecordingSettings, username: &str) {
    if !cfg.enabled {
        for key in RECORDING_KEYS {
            params.remove(key);
        }
        return;
    }

    params.insert("recording-path".into(), json!(cfg.path));
    params.insert(
        "recording-include-keys".into(),
        json!(bool_param(cfg.include_keys)),
    );
    params.insert(
        "create-recording-path".into(),
        json!(bool_param(cfg.auto_create_path)),
    );
    if cfg.name.is_empty() {
        // Let the gateway pick its default name.
        params.remove("recording-name");
    } else {
        params.insert(
            "recording-name".into(),
            json!(substitute_recording_name(&cfg.name, username)),
        );
    }
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_expands_all_variables() {
        let name = substitute_recording_name("${GUAC_USERNAME}-${GUAC_DATE}-${GUAC_TIME}", "alice");
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts[0], "alice");
        assert_eq!(parts[1].len(), 8); // YYYYMMDD
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 6); // HHMMSS
        assert!(parts[2].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn empty_username_becomes_unknown() {
        assert_eq!(substitute_recording_name("${GUAC_USERNAME}", ""), "unknown");
    }

    #[test]
    fn enabled_recording_sets_parameters() {
        let cfg = RecordingSettings {
            enabled: true,
            include_keys: true,
            ..Default::default()
        };
        let mut params = Map::new();
        apply_recording(&mut params, &cfg, "bob");
        assert_eq!(params["recording-path"], json!("/recordings"));
        assert_eq!(params["recording-include-keys"], json!("true"));
        assert_eq!(params["create-recording-path"], json!("true"));
        assert!(params["recording-name"]
            .as_str()
            .unwrap()
            .starts_with("bob-"));
    }

    #[test]
    fn disabled_recording_strips_parameters() {
        let cfg = RecordingSettings::default();
        let mut params = Map::new();
        params.insert("recording-path".into(), json!("/old"));
        params.insert("recording-name".into(), json!("old-name"));
        params.insert("hostname".into(), json!("10.0.0.1"));
        apply_recording(&mut params, &cfg, "bob");
        for key in RECORDING_KEYS {
            assert!(!params.contains_key(key), "{key} should be removed");
        }
        assert_eq!(params["hostname"], json!("10.0.0.1"));
    }

    #[test]
    fn empty_name_pattern_is_left_to_the_gateway() {
        let cfg = RecordingSettings {
            enabled: true,
            name: String::new(),
            ..Default::default()
        };
        let mut params = Map::new();
        params.insert("recording-name".into(), json!("stale"));
        apply_recording(&mut params, &cfg, "bob");
        assert!(!params.contains_key("recording-name"));
        assert!(params.contains_key("recording-path"));
    }
}
