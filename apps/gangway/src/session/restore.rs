//! Choosing how to rebuild the workspace after a successful `auth` ack.

use serde_json::Value;

use crate::layout::LayoutSnapshot;

#[derive(Debug, Clone, PartialEq)]
pub enum RestorePlan {
    /// Keep the local layout and reopen every pane's substream.
    Reattach,
    /// Replace the local layout with the host's snapshot.
    Rebuild(LayoutSnapshot),
    /// Start over with one window holding one full-size pane.
    /// `unexpected_marker` is set when a marker was held but there was
    /// nothing local to reattach to.
    Fresh { unexpected_marker: bool },
}

pub fn plan(marker: Option<i64>, local_windows: usize, snapshot: Option<LayoutSnapshot>) -> RestorePlan {
    if marker.is_some() && local_windows > 0 {
        return RestorePlan::Reattach;
    }
    match snapshot {
        Some(snapshot) if !snapshot.is_empty() => RestorePlan::Rebuild(snapshot),
        _ => RestorePlan::Fresh {
            unexpected_marker: marker.is_some(),
        },
    }
}

/// Extracts the layout snapshot from an `auth` ack body. The host sends
/// either the object itself or its JSON text; anything else counts as no
/// snapshot.
pub fn snapshot_from_body(body: &Value) -> Option<LayoutSnapshot> {
    let parsed = match body {
        Value::Null => return None,
        Value::String(text) if text.trim().is_empty() => return None,
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    };
    match parsed {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::warn!(target: "gangway::session", error = %err, "ignoring unparsable layout snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::WindowSnapshot;
    use serde_json::json;

    fn snapshot(names: &[&str]) -> LayoutSnapshot {
        LayoutSnapshot {
            windows: names
                .iter()
                .map(|name| WindowSnapshot {
                    name: name.to_string(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn marker_with_local_windows_reattaches() {
        assert_eq!(plan(Some(7), 1, Some(snapshot(&["w1", "w2"]))), RestorePlan::Reattach);
    }

    #[test]
    fn snapshot_without_marker_rebuilds() {
        assert_eq!(
            plan(None, 1, Some(snapshot(&["w1", "w2"]))),
            RestorePlan::Rebuild(snapshot(&["w1", "w2"]))
        );
    }

    #[test]
    fn nothing_to_restore_starts_fresh() {
        assert_eq!(plan(None, 0, None), RestorePlan::Fresh { unexpected_marker: false });
        assert_eq!(
            plan(None, 2, Some(LayoutSnapshot::default())),
            RestorePlan::Fresh { unexpected_marker: false }
        );
    }

    #[test]
    fn marker_without_windows_is_flagged() {
        assert_eq!(plan(Some(3), 0, None), RestorePlan::Fresh { unexpected_marker: true });
    }

    #[test]
    fn snapshot_body_forms() {
        assert_eq!(snapshot_from_body(&Value::Null), None);
        assert_eq!(
            snapshot_from_body(&json!({"windows": [{"name": "a"}]})),
            Some(snapshot(&["a"]))
        );
        assert_eq!(
            snapshot_from_body(&json!(r#"{"windows":[{"name":"a"}]}"#)),
            Some(snapshot(&["a"]))
        );
        assert_eq!(snapshot_from_body(&json!(42)), None);
    }
}
