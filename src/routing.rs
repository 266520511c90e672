//! Model router: re-resolves the requested model to one the caller's role
//! permits, using tier-ordered downgrade.

use crate::catalog;

#[derive(Debug, Clone)]
pub struct Resolution {
    pub resolved_model: String,
    pub downgraded: bool,
    pub effective_role: &'static str,
}

pub fn resolve_model(requested: &str, role: &str) -> Resolution {
    let role_def = catalog::role_def(role);

    if role_def.name == "admin" {
        return Resolution {
            resolved_model: requested.to_string(),
            downgraded: false,
            effective_role: role_def.name,
        };
    }

    if role_def.permitted_models.contains(&requested) {
        return Resolution {
            resolved_model: requested.to_string(),
            downgraded: false,
            effective_role: role_def.name,
        };
    }

    // Highest-tier permitted model; an empty grant falls back to the system
    // default.
    let best = role_def
        .permitted_models
        .iter()
        .filter_map(|id| catalog::model_def(id))
        .max_by_key(|m| m.tier)
        .map(|m| m.id)
        .unwrap_or(catalog::DEFAULT_MODEL);

    Resolution {
        resolved_model: best.to_string(),
        downgraded: true,
        effective_role: role_def.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_requesting_opus_downgrades_to_sonnet() {
        let resolution = resolve_model("claude-opus-4-20250514", "business");
        assert_eq!(resolution.resolved_model, "claude-sonnet-4-20250514");
        assert!(resolution.downgraded);
        assert_eq!(resolution.effective_role, "business");
    }

    #[test]
    fn engineer_keeps_opus() {
        let resolution = resolve_model("claude-opus-4-20250514", "engineer");
        assert_eq!(resolution.resolved_model, "claude-opus-4-20250514");
        assert!(!resolution.downgraded);
    }

    #[test]
    fn admin_passes_through_even_unknown_models() {
        let resolution = resolve_model("claude-experimental-next", "admin");
        assert_eq!(resolution.resolved_model, "claude-experimental-next");
        assert!(!resolution.downgraded);
    }

    #[test]
    fn unknown_role_is_treated_as_business() {
        let resolution = resolve_model("claude-opus-4-20250514", "wizard");
        assert_eq!(resolution.effective_role, "business");
        assert!(resolution.downgraded);
    }

    #[test]
    fn resolved_model_is_always_permitted_for_non_admin() {
        for role in ["engineer", "power_user", "business"] {
            for requested in [
                "claude-opus-4-20250514",
                "claude-sonnet-4-20250514",
                "claude-3-5-haiku-20241022",
                "made-up-model",
            ] {
                let resolution = resolve_model(requested, role);
                let permitted = catalog::role_def(role).permitted_models;
                assert!(
                    permitted.contains(&resolution.resolved_model.as_str()),
                    "{role} resolved {requested} to unpermitted {}",
                    resolution.resolved_model
                );
                assert_eq!(resolution.downgraded, !permitted.contains(&requested));
            }
        }
    }
}
