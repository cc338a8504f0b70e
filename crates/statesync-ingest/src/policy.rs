//! State assignment policies
//!
//! Decide which [`ModuleState`] a scanned record gets. The default trusts
//! the document and only invents a state when the node carries none.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use statesync_common::ModuleState;

/// Chooses the state of a record from what the document reported
pub trait StatePolicy: Send + Sync + fmt::Debug {
    fn assign(&self, reported: Option<ModuleState>) -> ModuleState;
}

/// Uniform random pick among all states, ignoring the document
///
/// Used for simulated feeds that carry no state of their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomStatePolicy;

impl StatePolicy for RandomStatePolicy {
    fn assign(&self, _reported: Option<ModuleState>) -> ModuleState {
        let index = rand::rng().random_range(0..ModuleState::ALL.len());
        ModuleState::ALL[index]
    }
}

/// Always the same state
#[derive(Debug, Clone, Copy)]
pub struct FixedStatePolicy(pub ModuleState);

impl StatePolicy for FixedStatePolicy {
    fn assign(&self, _reported: Option<ModuleState>) -> ModuleState {
        self.0
    }
}

/// The reported state, or the fallback's choice when there is none
#[derive(Debug, Clone)]
pub struct ReportedStatePolicy {
    fallback: Arc<dyn StatePolicy>,
}

impl ReportedStatePolicy {
    pub fn with_fallback(fallback: Arc<dyn StatePolicy>) -> Self {
        Self { fallback }
    }
}

impl Default for ReportedStatePolicy {
    fn default() -> Self {
        Self::with_fallback(Arc::new(RandomStatePolicy))
    }
}

impl StatePolicy for ReportedStatePolicy {
    fn assign(&self, reported: Option<ModuleState>) -> ModuleState {
        reported.unwrap_or_else(|| self.fallback.assign(None))
    }
}

/// Policy selector as written in configuration: `reported`, `random` or
/// `fixed:<State>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatePolicyKind {
    #[default]
    Reported,
    Random,
    Fixed(ModuleState),
}

impl StatePolicyKind {
    pub fn build(self) -> Arc<dyn StatePolicy> {
        match self {
            StatePolicyKind::Reported => Arc::new(ReportedStatePolicy::default()),
            StatePolicyKind::Random => Arc::new(RandomStatePolicy),
            StatePolicyKind::Fixed(state) => Arc::new(FixedStatePolicy(state)),
        }
    }
}

impl FromStr for StatePolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some((kind, state)) if kind.eq_ignore_ascii_case("fixed") => {
                Ok(StatePolicyKind::Fixed(state.parse()?))
            }
            None if s.eq_ignore_ascii_case("reported") => Ok(StatePolicyKind::Reported),
            None if s.eq_ignore_ascii_case("random") => Ok(StatePolicyKind::Random),
            _ => Err(anyhow::anyhow!(
                "Invalid state policy '{}', expected reported, random or fixed:<State>",
                s
            )),
        }
    }
}

impl fmt::Display for StatePolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatePolicyKind::Reported => f.write_str("reported"),
            StatePolicyKind::Random => f.write_str("random"),
            StatePolicyKind::Fixed(state) => write!(f, "fixed:{state}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_policy_prefers_document_state() {
        let policy = ReportedStatePolicy::with_fallback(Arc::new(FixedStatePolicy(
            ModuleState::Offline,
        )));

        assert_eq!(policy.assign(Some(ModuleState::Run)), ModuleState::Run);
        assert_eq!(policy.assign(None), ModuleState::Offline);
    }

    #[test]
    fn test_random_policy_stays_in_range() {
        let policy = RandomStatePolicy;
        for _ in 0..64 {
            let state = policy.assign(Some(ModuleState::Online));
            assert!(ModuleState::ALL.contains(&state));
        }
    }

    #[test]
    fn test_policy_kind_from_str() {
        assert_eq!(
            "reported".parse::<StatePolicyKind>().unwrap(),
            StatePolicyKind::Reported
        );
        assert_eq!(
            "RANDOM".parse::<StatePolicyKind>().unwrap(),
            StatePolicyKind::Random
        );
        assert_eq!(
            "fixed:NotReady".parse::<StatePolicyKind>().unwrap(),
            StatePolicyKind::Fixed(ModuleState::NotReady)
        );
        assert!("fixed:Sleeping".parse::<StatePolicyKind>().is_err());
        assert!("latest".parse::<StatePolicyKind>().is_err());
    }

    #[test]
    fn test_policy_kind_display_parses_back() {
        let kind = StatePolicyKind::Fixed(ModuleState::Run);
        assert_eq!(kind.to_string(), "fixed:Run");
        assert_eq!(kind.to_string().parse::<StatePolicyKind>().unwrap(), kind);
    }
}
