//! Visibility Decision Engine.
//!
//! This is the only place the show/hide rule lives. Every trigger path
//! reaches it through the orchestrator; nothing else may re-derive it.

use serde::{Deserialize, Serialize};

use crate::identity::{Scope, WindowIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Show,
    Hide,
}

pub const REASON_GLOBAL: &str = "global window";
pub const REASON_MATCH: &str = "scoped window, project match";
pub const REASON_MISMATCH: &str = "scoped window, project mismatch";
pub const REASON_NO_ACTIVE: &str = "scoped window, no active project";

/// `Hide` iff the window is scoped to a project other than the active one.
pub fn decide(active_project: Option<&str>, identity: &WindowIdentity) -> Decision {
    explain(active_project, identity).0
}

/// [`decide`] plus the audit reason.
pub fn explain(active_project: Option<&str>, identity: &WindowIdentity) -> (Decision, &'static str) {
    match identity.scope {
        Scope::Global => (Decision::Show, REASON_GLOBAL),
        Scope::Scoped => {
            if identity.project.as_deref() == active_project {
                (Decision::Show, REASON_MATCH)
            } else if active_project.is_none() {
                (Decision::Hide, REASON_NO_ACTIVE)
            } else {
                (Decision::Hide, REASON_MISMATCH)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentitySource;

    fn scoped(project: &str) -> WindowIdentity {
        WindowIdentity::scoped("code", project, IdentitySource::Mark).expect("identity")
    }

    #[test]
    fn global_windows_always_show() {
        let identity = WindowIdentity::global("firefox", IdentitySource::Mark).expect("identity");
        assert_eq!(decide(Some("alpha"), &identity), Decision::Show);
        assert_eq!(decide(None, &identity), Decision::Show);
    }

    #[test]
    fn scoped_window_follows_active_project() {
        let identity = scoped("alpha");
        assert_eq!(explain(Some("alpha"), &identity), (Decision::Show, REASON_MATCH));
        assert_eq!(
            explain(Some("beta"), &identity),
            (Decision::Hide, REASON_MISMATCH)
        );
    }

    #[test]
    fn scoped_window_hides_without_active_project() {
        assert_eq!(
            explain(None, &scoped("alpha")),
            (Decision::Hide, REASON_NO_ACTIVE)
        );
    }

    #[test]
    fn unclassified_windows_show() {
        let identity = WindowIdentity::unclassified(Some("xterm"));
        assert_eq!(decide(Some("alpha"), &identity), Decision::Show);
    }

    #[test]
    fn scratchpad_terminals_obey_the_same_rule() {
        let identity = WindowIdentity::scratchpad("alpha", IdentitySource::Mark).expect("pad");
        assert_eq!(decide(Some("alpha"), &identity), Decision::Show);
        assert_eq!(decide(Some("beta"), &identity), Decision::Hide);
    }
}
