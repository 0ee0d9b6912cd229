//! Headless permission policy.
//!
//! acpx never prompts a user. Permission requests arriving from the agent
//! are answered from the policy the submitter supplied with the prompt, and
//! counted into the per-prompt [`acpx_core::PermissionStats`].

use std::collections::BTreeMap;

use acpx_core::PermissionOption;
use serde_json::Value;

/// Decision source for `session/request_permission`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PermissionPolicy {
    /// No policy supplied: requests resolve as cancelled.
    #[default]
    Unavailable,
    AllowAll,
    DenyAll,
    /// Per permission-kind decisions, e.g. `{"edit": true, "execute": false}`.
    /// Kinds missing from the map fall back to deny.
    PerKind(BTreeMap<String, bool>),
}

impl PermissionPolicy {
    /// Build from the prompt's `permissionMode` plus the optional
    /// `nonInteractivePermissions` value, which takes precedence.
    pub fn resolve(permission_mode: Option<&str>, non_interactive: Option<&Value>) -> Self {
        if let Some(value) = non_interactive {
            match value {
                Value::String(s) if s == "allow" => return PermissionPolicy::AllowAll,
                Value::String(s) if s == "deny" => return PermissionPolicy::DenyAll,
                Value::Object(map) => {
                    let kinds = map
                        .iter()
                        .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                        .collect();
                    return PermissionPolicy::PerKind(kinds);
                }
                _ => {}
            }
        }
        match permission_mode {
            Some("bypassPermissions") | Some("acceptEdits") => PermissionPolicy::AllowAll,
            _ => PermissionPolicy::Unavailable,
        }
    }

    /// Pick an option for a permission request, or `None` for a cancelled
    /// outcome.
    pub fn choose<'a>(
        &self,
        options: &'a [PermissionOption],
        request_kind: Option<&str>,
    ) -> PermissionDecision<'a> {
        let allow = options
            .iter()
            .find(|o| o.kind.starts_with("allow"))
            .or_else(|| options.first());
        let reject = options.iter().find(|o| o.kind.starts_with("reject"));
        match self {
            PermissionPolicy::Unavailable => PermissionDecision::Cancelled,
            PermissionPolicy::AllowAll => allow
                .map(PermissionDecision::Approved)
                .unwrap_or(PermissionDecision::Cancelled),
            PermissionPolicy::DenyAll => reject
                .map(PermissionDecision::Denied)
                .unwrap_or(PermissionDecision::Cancelled),
            PermissionPolicy::PerKind(kinds) => {
                let allowed = request_kind.and_then(|k| kinds.get(k).copied()).unwrap_or(false);
                if allowed {
                    allow
                        .map(PermissionDecision::Approved)
                        .unwrap_or(PermissionDecision::Cancelled)
                } else {
                    reject
                        .map(PermissionDecision::Denied)
                        .unwrap_or(PermissionDecision::Cancelled)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PermissionDecision<'a> {
    Approved(&'a PermissionOption),
    Denied(&'a PermissionOption),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> Vec<PermissionOption> {
        vec![
            PermissionOption {
                option_id: "yes".into(),
                name: "Allow".into(),
                kind: "allow_once".into(),
            },
            PermissionOption {
                option_id: "no".into(),
                name: "Reject".into(),
                kind: "reject_once".into(),
            },
        ]
    }

    #[test]
    fn non_interactive_value_wins_over_mode() {
        let policy = PermissionPolicy::resolve(Some("bypassPermissions"), Some(&json!("deny")));
        assert_eq!(policy, PermissionPolicy::DenyAll);
    }

    #[test]
    fn default_mode_without_policy_is_unavailable() {
        let policy = PermissionPolicy::resolve(Some("default"), None);
        assert_eq!(policy, PermissionPolicy::Unavailable);
        assert_eq!(policy.choose(&options(), None), PermissionDecision::Cancelled);
    }

    #[test]
    fn per_kind_map_falls_back_to_deny() {
        let policy =
            PermissionPolicy::resolve(None, Some(&json!({"edit": true, "execute": false})));
        let opts = options();
        assert!(matches!(
            policy.choose(&opts, Some("edit")),
            PermissionDecision::Approved(o) if o.option_id == "yes"
        ));
        assert!(matches!(
            policy.choose(&opts, Some("execute")),
            PermissionDecision::Denied(_)
        ));
        assert!(matches!(
            policy.choose(&opts, Some("network")),
            PermissionDecision::Denied(_)
        ));
    }

    #[test]
    fn accept_edits_mode_allows() {
        let policy = PermissionPolicy::resolve(Some("acceptEdits"), None);
        assert!(matches!(
            policy.choose(&options(), None),
            PermissionDecision::Approved(_)
        ));
    }
}
