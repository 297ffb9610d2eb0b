use crate::config::{Config, ShortcutConfig, PLACEHOLDER};
use crate::core::{Claim, MatchPolicy, ProviderId, Query, ResultAction, ResultItem};

/// Shown in place of `%s` while no argument has been typed.
const ELLIPSIS: &str = "...";

/// A built-in keyword shortcut (quicklink or script).
#[derive(Debug, Clone)]
pub struct ShortcutProvider {
    config: ShortcutConfig,
    triggers: Vec<String>,
}

impl ShortcutProvider {
    pub fn new(config: ShortcutConfig) -> Self {
        let triggers = vec![config.keyword.clone()];
        Self { config, triggers }
    }

    /// Shortcuts from configuration, in declaration order.
    pub fn from_config(config: &Config) -> Vec<Self> {
        let shortcuts: Vec<_> = config.shortcuts.iter().cloned().map(Self::new).collect();
        tracing::debug!("Loaded {} shortcuts", shortcuts.len());
        shortcuts
    }

    pub fn keyword(&self) -> &str {
        &self.config.keyword
    }

    pub fn policy(&self) -> MatchPolicy<'_> {
        MatchPolicy {
            triggers: &self.triggers,
            run_without_argument: self.config.run_without_argument,
            default_search: self.config.default_search,
        }
    }

    /// Description line for a result claimed via `claim`.
    ///
    /// Only a typed keyword fills in `%s`; a default-search fallback shows
    /// the placeholder.
    pub fn description(&self, claim: Option<&Claim>) -> String {
        match claim {
            Some(Claim::Static) => self.config.target.clone(),
            Some(Claim::Keyword {
                argument: Some(argument),
            }) => self.config.resolve_target(argument),
            Some(Claim::Keyword { argument: None })
            | Some(Claim::DefaultSearch { .. })
            | None => self.config.target.replace(PLACEHOLDER, ELLIPSIS),
        }
    }

    /// Action to perform when the result is selected.
    pub fn activation(&self, claim: Option<&Claim>) -> ResultAction {
        match claim {
            Some(Claim::Static) => target_action(self.config.target.clone(), None),
            Some(Claim::Keyword {
                argument: Some(argument),
            })
            | Some(Claim::DefaultSearch { argument }) => {
                target_action(self.config.resolve_target(argument), Some(argument.clone()))
            }
            Some(Claim::Keyword { argument: None }) | None => ResultAction::SetQuery {
                query: format!("{} ", self.config.keyword),
            },
        }
    }

    /// Activate directly from query text, as when the user presses enter
    /// without selecting a listed result.
    pub fn activate(&self, query: &Query) -> ResultAction {
        let policy = self.policy();
        let claim = policy
            .keyword_claim(query)
            .or_else(|| policy.fallback_claim(query));
        self.activation(claim.as_ref())
    }

    pub fn respond(&self, _query: &Query, claim: &Claim) -> ResultItem {
        ResultItem {
            source: ProviderId::Shortcut(self.config.keyword.clone()),
            title: self.config.name.clone(),
            description: Some(self.description(Some(claim))),
            icon: self.config.icon.clone(),
            action: self.activation(Some(claim)),
        }
    }
}

fn target_action(resolved: String, argument: Option<String>) -> ResultAction {
    if resolved.contains("://") {
        ResultAction::Open { url: resolved }
    } else {
        ResultAction::Run {
            command: resolved,
            argument,
        }
    }
}
